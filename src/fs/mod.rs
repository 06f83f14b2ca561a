use std::{
    collections::{BTreeMap, BTreeSet},
    fs, io,
    path::{Path, PathBuf},
    sync::{Arc, Mutex, MutexGuard},
};

use anyhow::bail;

// The export target. Paths are relative to the root of the tree being written.
// Implementations are shared between writer threads.
pub trait TileDir: Clone + Send + Sync {
    // Creates `rel` and any missing parents. Already existing is fine,
    // including when another writer creates it concurrently.
    fn ensure_dir<P>(&self, rel: &P) -> anyhow::Result<()>
    where
        P: AsRef<Path>;

    // Writes the whole file, replacing any previous content.
    fn write<P>(&self, rel: &P, data: &[u8]) -> anyhow::Result<()>
    where
        P: AsRef<Path>;
}

#[derive(Clone, Debug)]
pub struct OsDir {
    root: PathBuf,
}

impl OsDir {
    pub fn new<P: Into<PathBuf>>(root: P) -> Self {
        OsDir { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }
}

impl TileDir for OsDir {
    fn ensure_dir<P>(&self, rel: &P) -> anyhow::Result<()>
    where
        P: AsRef<Path>,
    {
        match fs::create_dir_all(self.root.join(rel)) {
            Ok(()) => Ok(()),
            // Lost a race with another writer.
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    fn write<P>(&self, rel: &P, data: &[u8]) -> anyhow::Result<()>
    where
        P: AsRef<Path>,
    {
        fs::write(self.root.join(rel), data)?;
        Ok(())
    }
}

// Mock Implementation
#[derive(Debug, Clone)]
pub enum Event {
    MkDir(String),
    Write(String, Vec<u8>),
}

impl Event {
    pub fn write_abbrev<W: std::fmt::Write>(&self, w: &mut W) -> std::fmt::Result {
        match self {
            Event::MkDir(name) => write!(w, "MkDir({})", name),
            Event::Write(name, contents) => match std::str::from_utf8(contents) {
                Ok(text) => write!(w, "Write({}, {})", name, text),
                Err(_) => write!(
                    w,
                    "Write({}, {})",
                    name,
                    contents
                        .iter()
                        .flat_map(|ch| std::ascii::escape_default(*ch))
                        .map(char::from)
                        .collect::<String>()
                ),
            },
        }
    }
}

#[derive(Debug, Default)]
pub struct MockFs {
    dirs: BTreeSet<String>,
    files: BTreeMap<String, Vec<u8>>,
    events: Vec<Event>,

    // After this many writes, fail every subsequent write.
    writes_until_failure: Option<usize>,
}

impl MockFs {
    fn check_write(&mut self) -> anyhow::Result<()> {
        match self.writes_until_failure {
            Some(0) => bail!(io::Error::new(io::ErrorKind::Other, "disk is full")),
            Some(n) => {
                self.writes_until_failure = Some(n - 1);
                Ok(())
            }
            None => Ok(()),
        }
    }

    fn record(&mut self, e: Event) {
        self.events.push(e);
    }

    pub fn schedule_failure(&mut self, writes: usize) {
        self.writes_until_failure = Some(writes);
    }

    pub fn take_events(&mut self) -> Vec<Event> {
        std::mem::take(&mut self.events)
    }

    pub fn files(&self) -> &BTreeMap<String, Vec<u8>> {
        &self.files
    }
}

#[derive(Clone, Debug, Default)]
pub struct MockDir {
    pub fs: Arc<Mutex<MockFs>>,
}

impl MockDir {
    pub fn new() -> Self {
        MockDir::default()
    }

    pub fn lock(&self) -> MutexGuard<'_, MockFs> {
        // A poisoned lock only means a writer thread panicked mid-test.
        self.fs.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn name<P: AsRef<Path>>(p: &P) -> String {
        p.as_ref()
            .iter()
            .map(|s| s.to_string_lossy())
            .collect::<Vec<_>>()
            .join("/")
    }
}

impl TileDir for MockDir {
    fn ensure_dir<P>(&self, rel: &P) -> anyhow::Result<()>
    where
        P: AsRef<Path>,
    {
        let name = Self::name(rel);
        let mut fs = self.lock();
        if fs.dirs.insert(name.clone()) {
            fs.record(Event::MkDir(name));
        }
        Ok(())
    }

    fn write<P>(&self, rel: &P, data: &[u8]) -> anyhow::Result<()>
    where
        P: AsRef<Path>,
    {
        let name = Self::name(rel);
        let mut fs = self.lock();
        fs.check_write()?;
        let parent = name.rsplit_once('/').map(|(d, _)| d.to_owned());
        if let Some(parent) = parent {
            if !fs.dirs.contains(&parent) {
                bail!(io::Error::new(
                    io::ErrorKind::NotFound,
                    format!("no directory {}", parent)
                ));
            }
        }
        fs.record(Event::Write(name.clone(), data.to_vec()));
        fs.files.insert(name, data.to_vec());
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::{MockDir, OsDir, TileDir};

    #[test]
    fn test_mock_dir() -> anyhow::Result<()> {
        let dir = MockDir::new();

        assert!(dir.write(&"1/2/3.png", &[1, 2, 3]).is_err());

        dir.ensure_dir(&"1/2")?;
        dir.ensure_dir(&"1/2")?;
        dir.write(&"1/2/3.png", &[1, 2, 3])?;
        dir.write(&"metadata.json", b"{}")?;

        let mut fs = dir.lock();
        assert_eq!(Some(&vec![1, 2, 3]), fs.files().get("1/2/3.png"));
        assert_eq!(3, fs.take_events().len());

        fs.schedule_failure(1);
        drop(fs);
        dir.write(&"a", &[])?;
        assert!(dir.write(&"b", &[]).is_err());

        Ok(())
    }

    #[test]
    fn test_os_dir() -> anyhow::Result<()> {
        let tmp = tempfile::tempdir()?;
        let dir = OsDir::new(tmp.path());
        dir.ensure_dir(&"3/4")?;
        dir.ensure_dir(&"3/4")?;
        dir.write(&"3/4/5.png", b"tile")?;
        assert_eq!(b"tile".to_vec(), std::fs::read(tmp.path().join("3/4/5.png"))?);
        Ok(())
    }
}
