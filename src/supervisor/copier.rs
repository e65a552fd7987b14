use std::fs::{File, OpenOptions};
use std::io::{self, BufReader, BufWriter, Write};
use std::path::Path;

/// Copies one file. Runs inside the child after privileges are dropped.
pub trait Copier: Send + Sync {
    fn copy(&self, source: &Path, destination: &Path) -> io::Result<()>;
}

/// Plain read/write copier.
///
/// Does not create directories. The destination gets the source's
/// modification time once all bytes are written, so an interrupted copy
/// still looks stale to the next reconciliation.
#[derive(Debug, Default, Clone, Copy)]
pub struct FileCopier;

impl Copier for FileCopier {
    fn copy(&self, source: &Path, destination: &Path) -> io::Result<()> {
        let input = File::open(source)?;
        let modified = input.metadata()?.modified()?;

        let output = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(destination)?;

        let mut reader = BufReader::with_capacity(64 * 1024, input);
        let mut writer = BufWriter::with_capacity(64 * 1024, output);
        io::copy(&mut reader, &mut writer)?;
        writer.flush()?;

        let output = writer.into_inner().map_err(|e| e.into_error())?;
        output.sync_all()?;
        output.set_modified(modified)?;
        Ok(())
    }
}
