use serde::de::DeserializeOwned;
use serde::Serialize;
use std::fs::{self, File, OpenOptions};
use std::io::{self, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};

/// JSON document replaced atomically on every write.
#[derive(Debug, Clone)]
pub struct JsonFile {
    path: PathBuf,
}

impl JsonFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Write `data` to a temp file beside the target, fsync it, then
    /// rename it into place. Readers see the old or the new document,
    /// never a partial one.
    pub fn checkpoint<T: Serialize + ?Sized>(&self, data: &T) -> io::Result<()> {
        let dir = self.path.parent().unwrap_or_else(|| Path::new("."));
        let base = self
            .path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let tmp = dir.join(format!("{}.tmp{}", base, uuid::Uuid::new_v4().simple()));

        let result = write_synced(&tmp, data).and_then(|()| fs::rename(&tmp, &self.path));
        if result.is_err() {
            let _ = fs::remove_file(&tmp);
        }
        result?;

        // Persist the rename itself.
        File::open(dir)?.sync_all()
    }

    /// Read the document back; `Ok(None)` when it was never written.
    pub fn restore<T: DeserializeOwned>(&self) -> io::Result<Option<T>> {
        let file = match File::open(&self.path) {
            Ok(f) => f,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e),
        };
        let data = serde_json::from_reader(BufReader::new(file))
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        Ok(Some(data))
    }
}

fn write_synced<T: Serialize + ?Sized>(path: &Path, data: &T) -> io::Result<()> {
    let file = OpenOptions::new().write(true).create_new(true).open(path)?;
    let mut writer = BufWriter::new(file);
    serde_json::to_writer(&mut writer, data)?;
    writer.write_all(b"\n")?;
    let file = writer.into_inner().map_err(|e| e.into_error())?;
    file.sync_all()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_file_restores_none() {
        let dir = tempfile::tempdir().unwrap();
        let file = JsonFile::new(dir.path().join("data.json"));
        let restored: Option<Vec<String>> = file.restore().unwrap();
        assert!(restored.is_none());
    }

    #[test]
    fn checkpoint_replaces_and_leaves_no_temp_files() {
        let dir = tempfile::tempdir().unwrap();
        let file = JsonFile::new(dir.path().join("data.json"));

        file.checkpoint(&vec!["a".to_string()]).unwrap();
        file.checkpoint(&vec!["b".to_string(), "c".to_string()]).unwrap();

        let restored: Vec<String> = file.restore().unwrap().unwrap();
        assert_eq!(restored, vec!["b", "c"]);

        let names: Vec<_> = fs::read_dir(dir.path())
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        assert_eq!(names, vec!["data.json"]);
    }

    #[test]
    fn corrupt_file_is_invalid_data() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("data.json");
        fs::write(&path, "[{").unwrap();
        let err = JsonFile::new(&path).restore::<Vec<String>>().unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }
}
