use std::fs;
use std::io::{self, BufRead, BufReader};

use camino::Utf8Path;
use flate2::read::MultiGzDecoder;

use crate::error::PipelineError;

/// Line reader over a plain or gzip-compressed text file, chosen by extension.
pub fn open_text(path: &Utf8Path) -> Result<Box<dyn BufRead>, PipelineError> {
    let file = fs::File::open(path.as_std_path())
        .map_err(|err| PipelineError::Filesystem(format!("open {path}: {err}")))?;
    if path.extension() == Some("gz") {
        Ok(Box::new(BufReader::new(MultiGzDecoder::new(file))))
    } else {
        Ok(Box::new(BufReader::new(file)))
    }
}

pub fn read_lines(path: &Utf8Path) -> Result<Vec<String>, PipelineError> {
    open_text(path)?
        .lines()
        .collect::<io::Result<Vec<_>>>()
        .map_err(|err| PipelineError::Filesystem(format!("read {path}: {err}")))
}

/// Appends `sources` byte-for-byte into `dest`. Concatenated gzip members
/// remain one valid gzip stream.
pub fn concat_files(sources: &[&Utf8Path], dest: &Utf8Path) -> Result<(), PipelineError> {
    let mut out = fs::File::create(dest.as_std_path())
        .map_err(|err| PipelineError::Filesystem(format!("create {dest}: {err}")))?;
    for source in sources {
        let mut input = fs::File::open(source.as_std_path())
            .map_err(|err| PipelineError::Filesystem(format!("open {source}: {err}")))?;
        io::copy(&mut input, &mut out)
            .map_err(|err| PipelineError::Filesystem(err.to_string()))?;
    }
    Ok(())
}

pub fn remove_if_exists(path: &Utf8Path) -> Result<(), PipelineError> {
    match fs::remove_file(path.as_std_path()) {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(err) => Err(PipelineError::Filesystem(format!("remove {path}: {err}"))),
    }
}

pub fn ensure_parent(path: &Utf8Path) -> Result<(), PipelineError> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent.as_std_path())
            .map_err(|err| PipelineError::Filesystem(format!("create {parent}: {err}")))?;
    }
    Ok(())
}
