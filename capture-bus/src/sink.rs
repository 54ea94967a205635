use std::{
    fs::File,
    io::{BufWriter, Write},
    path::{Path, PathBuf},
    sync::{Arc, Mutex, PoisonError},
};

/// Destination for container bytes.
pub type Sink = Box<dyn Write + Send>;

pub fn file_sink(path: impl AsRef<Path>) -> anyhow::Result<Sink> {
    let path = path.as_ref();
    let file = File::create(path)
        .map_err(|e| anyhow::anyhow!("create output {}: {}", path.display(), e))?;
    Ok(Box::new(BufWriter::new(file)))
}

/// In-memory sink whose contents stay readable through any clone.
#[derive(Clone, Default)]
pub struct MemorySink {
    inner: Arc<Mutex<Vec<u8>>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn contents(&self) -> Vec<u8> {
        self.inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn boxed(&self) -> Sink {
        Box::new(self.clone())
    }
}

impl Write for MemorySink {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

/// Where a context's first writer sends its output.
pub enum Output {
    Path(PathBuf),
    Sink(Sink),
}

impl Output {
    pub fn path(path: impl Into<PathBuf>) -> Self {
        Output::Path(path.into())
    }

    pub fn describe(&self) -> String {
        match self {
            Output::Path(path) => path.display().to_string(),
            Output::Sink(_) => "<sink>".to_string(),
        }
    }
}

impl From<MemorySink> for Output {
    fn from(sink: MemorySink) -> Self {
        Output::Sink(Box::new(sink))
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;

    #[test]
    fn test_memory_sink_shares_contents() -> anyhow::Result<()> {
        let sink = MemorySink::new();
        let mut boxed = sink.boxed();
        boxed.write_all(b"abc")?;
        boxed.write_all(b"de")?;
        assert_eq!(sink.contents(), b"abcde");
        assert_eq!(sink.len(), 5);
        Ok(())
    }

    #[test]
    fn test_file_sink_writes() -> anyhow::Result<()> {
        let path = std::env::temp_dir().join(format!("sink-{}.bin", uuid::Uuid::new_v4()));
        {
            let mut sink = file_sink(&path)?;
            sink.write_all(b"hello")?;
            sink.flush()?;
        }
        assert_eq!(std::fs::read(&path)?, b"hello");
        std::fs::remove_file(&path)?;
        Ok(())
    }
}
