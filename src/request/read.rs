use std::{fs, io};
use std::io::Error;
use std::path::{Path, PathBuf};

/// Request files in `dir`, sorted so submissions happen in a predictable order
pub fn get_message_paths(dir: &Path) -> Result<Vec<PathBuf>, Error> {
    let mut paths = fs::read_dir(dir)?
        .map(|res| res.map(|e| e.path()))
        .filter(|res| res.as_ref().map_or(true, |path| path.is_file()))
        .collect::<Result<Vec<PathBuf>, io::Error>>()?;
    paths.sort();
    Ok(paths)
}
