//! On-disk state: the operation graph file and the operation results file.
//!
//! Both share one layout, little-endian throughout: a 4-byte magic and
//! format version, a file table mapping local file ids to paths, then a
//! payload whose file ids all refer to the table.  Local ids in a file are
//! never assumed to match a live FileSystemState; the reader re-interns
//! every path and rewrites every id occurrence through the resulting
//! table.

use crate::fs::{FileId, FileSystemState, Timestamp};
use crate::graph::{
    CommandInfo, OperationGraph, OperationId, OperationInfo, OperationResult, OperationResults,
};
use crate::progress::Progress;
use anyhow::Context;
use rustc_hash::FxHashMap;
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use thiserror::Error;

pub const GRAPH_MAGIC: [u8; 4] = *b"BOG\0";
pub const RESULTS_MAGIC: [u8; 4] = *b"BOR\0";
pub const FORMAT_VERSION: u32 = 1;

#[derive(Debug, Error)]
pub enum FileReadError {
    #[error("bad magic, not an {0} file")]
    BadMagic(&'static str),
    #[error("unsupported format version {0}")]
    BadVersion(u32),
    #[error("file truncated")]
    Truncated,
    #[error("trailing bytes after payload")]
    TrailingBytes,
    #[error("string is not valid utf-8")]
    BadUtf8,
    #[error("reference to unknown local file id {0}")]
    UnknownLocalFileId(u32),
    #[error(transparent)]
    Io(std::io::Error),
}

impl From<std::io::Error> for FileReadError {
    fn from(err: std::io::Error) -> Self {
        if err.kind() == std::io::ErrorKind::UnexpectedEof {
            FileReadError::Truncated
        } else {
            FileReadError::Io(err)
        }
    }
}

struct Writer<W: Write> {
    w: W,
}

impl<W: Write> Writer<W> {
    fn write_u32(&mut self, n: u32) -> std::io::Result<()> {
        self.w.write_all(&n.to_le_bytes())
    }

    fn write_i64(&mut self, n: i64) -> std::io::Result<()> {
        self.w.write_all(&n.to_le_bytes())
    }

    fn write_str(&mut self, s: &str) -> std::io::Result<()> {
        self.write_u32(s.len() as u32)?;
        self.w.write_all(s.as_bytes())
    }

    fn write_id_list(&mut self, ids: &[FileId]) -> std::io::Result<()> {
        self.write_u32(ids.len() as u32)?;
        for &id in ids {
            self.write_u32(id.raw())?;
        }
        Ok(())
    }

    /// Write the file table: every FileId the payload will mention, with
    /// the live ids doubling as the local ids.
    fn write_file_table(&mut self, ids: &[FileId], fs: &FileSystemState) -> anyhow::Result<()> {
        self.write_u32(ids.len() as u32)?;
        for &id in ids {
            let path = path_str(fs.path(id)?)?;
            self.write_u32(id.raw())?;
            self.write_str(path)?;
        }
        Ok(())
    }
}

struct Reader<R: Read> {
    r: R,
}

impl<R: Read> Reader<R> {
    fn read_u32(&mut self) -> Result<u32, FileReadError> {
        let mut buf = [0u8; 4];
        self.r.read_exact(&mut buf)?;
        Ok(u32::from_le_bytes(buf))
    }

    fn read_i64(&mut self) -> Result<i64, FileReadError> {
        let mut buf = [0u8; 8];
        self.r.read_exact(&mut buf)?;
        Ok(i64::from_le_bytes(buf))
    }

    fn read_str(&mut self) -> Result<String, FileReadError> {
        let len = self.read_u32()? as usize;
        let mut buf = vec![0u8; len];
        self.r.read_exact(&mut buf)?;
        String::from_utf8(buf).map_err(|_| FileReadError::BadUtf8)
    }

    fn expect_magic(&mut self, magic: &[u8; 4], kind: &'static str) -> Result<(), FileReadError> {
        let mut buf = [0u8; 4];
        self.r.read_exact(&mut buf)?;
        if &buf != magic {
            return Err(FileReadError::BadMagic(kind));
        }
        let version = self.read_u32()?;
        if version != FORMAT_VERSION {
            return Err(FileReadError::BadVersion(version));
        }
        Ok(())
    }

    /// Read the file table and re-intern every path, producing the
    /// local-to-live id mapping used for the rest of the file.
    fn read_file_table(
        &mut self,
        fs: &mut FileSystemState,
    ) -> Result<FxHashMap<u32, FileId>, FileReadError> {
        let count = self.read_u32()?;
        let mut table = FxHashMap::default();
        for _ in 0..count {
            let local = self.read_u32()?;
            let path = self.read_str()?;
            let live = fs.to_file_id(Path::new(&path), Path::new("/"));
            table.insert(local, live);
        }
        Ok(table)
    }

    fn read_id_list(
        &mut self,
        table: &FxHashMap<u32, FileId>,
    ) -> Result<Vec<FileId>, FileReadError> {
        let count = self.read_u32()?;
        let mut ids = Vec::with_capacity(count as usize);
        for _ in 0..count {
            let local = self.read_u32()?;
            let live = table
                .get(&local)
                .ok_or(FileReadError::UnknownLocalFileId(local))?;
            ids.push(*live);
        }
        Ok(ids)
    }

    fn expect_eof(&mut self) -> Result<(), FileReadError> {
        let mut buf = [0u8; 1];
        match self.r.read(&mut buf)? {
            0 => Ok(()),
            _ => Err(FileReadError::TrailingBytes),
        }
    }
}

/// The on-disk format stores paths as utf-8.
fn path_str(path: &Path) -> anyhow::Result<&str> {
    path.to_str()
        .with_context(|| format!("non-utf8 path {:?}", path))
}

/// Every file id a graph mentions, deduplicated and sorted.
fn graph_file_ids(graph: &OperationGraph) -> Vec<FileId> {
    let mut ids = Vec::new();
    for id in graph.sorted_ids() {
        let op = graph.get(id).unwrap();
        ids.extend_from_slice(&op.declared_input);
        ids.extend_from_slice(&op.declared_output);
        ids.extend_from_slice(&op.read_access);
        ids.extend_from_slice(&op.write_access);
    }
    ids.sort();
    ids.dedup();
    ids
}

fn results_file_ids(results: &OperationResults) -> Vec<FileId> {
    let mut ids = Vec::new();
    for id in results.sorted_ids() {
        let result = results.get(id).unwrap();
        ids.extend_from_slice(&result.observed_input);
        ids.extend_from_slice(&result.observed_output);
    }
    ids.sort();
    ids.dedup();
    ids
}

pub fn write_graph<W: Write>(
    w: W,
    graph: &OperationGraph,
    fs: &FileSystemState,
) -> anyhow::Result<()> {
    let mut w = Writer { w };
    w.w.write_all(&GRAPH_MAGIC)?;
    w.write_u32(FORMAT_VERSION)?;
    w.write_file_table(&graph_file_ids(graph), fs)?;

    w.write_u32(graph.roots.len() as u32)?;
    for &root in &graph.roots {
        w.write_u32(root.raw())?;
    }

    w.write_u32(graph.len() as u32)?;
    for id in graph.sorted_ids() {
        let op = graph.get(id).unwrap();
        w.write_u32(op.id.raw())?;
        w.write_str(&op.title)?;
        w.write_str(path_str(&op.command.working_directory)?)?;
        w.write_str(&path_str(&op.command.executable)?)?;
        w.write_str(&op.command.arguments)?;
        w.write_id_list(&op.declared_input)?;
        w.write_id_list(&op.declared_output)?;
        w.write_id_list(&op.read_access)?;
        w.write_id_list(&op.write_access)?;
        w.write_u32(op.children.len() as u32)?;
        for &child in &op.children {
            w.write_u32(child.raw())?;
        }
        w.write_u32(op.dependency_count)?;
    }
    Ok(())
}

pub fn read_graph<R: Read>(
    r: R,
    fs: &mut FileSystemState,
) -> Result<OperationGraph, FileReadError> {
    let mut r = Reader { r };
    r.expect_magic(&GRAPH_MAGIC, "operation graph")?;
    let table = r.read_file_table(fs)?;

    let root_count = r.read_u32()?;
    let mut roots = Vec::with_capacity(root_count as usize);
    for _ in 0..root_count {
        roots.push(OperationId::from_raw(r.read_u32()?));
    }

    let op_count = r.read_u32()?;
    let mut operations = Vec::with_capacity(op_count as usize);
    for _ in 0..op_count {
        let id = OperationId::from_raw(r.read_u32()?);
        let title = r.read_str()?;
        let working_directory = PathBuf::from(r.read_str()?);
        let executable = PathBuf::from(r.read_str()?);
        let arguments = r.read_str()?;
        let declared_input = r.read_id_list(&table)?;
        let declared_output = r.read_id_list(&table)?;
        let read_access = r.read_id_list(&table)?;
        let write_access = r.read_id_list(&table)?;
        let child_count = r.read_u32()?;
        let mut children = Vec::with_capacity(child_count as usize);
        for _ in 0..child_count {
            children.push(OperationId::from_raw(r.read_u32()?));
        }
        let dependency_count = r.read_u32()?;
        operations.push(OperationInfo {
            id,
            title,
            command: CommandInfo {
                working_directory,
                executable,
                arguments,
            },
            declared_input,
            declared_output,
            read_access,
            write_access,
            children,
            dependency_count,
        });
    }
    r.expect_eof()?;
    Ok(OperationGraph::new(roots, operations))
}

pub fn write_results<W: Write>(
    w: W,
    results: &OperationResults,
    fs: &FileSystemState,
) -> anyhow::Result<()> {
    let mut w = Writer { w };
    w.w.write_all(&RESULTS_MAGIC)?;
    w.write_u32(FORMAT_VERSION)?;
    w.write_file_table(&results_file_ids(results), fs)?;

    w.write_u32(results.len() as u32)?;
    for id in results.sorted_ids() {
        let result = results.get(id).unwrap();
        w.write_u32(id.raw())?;
        w.write_u32(result.was_successful_run as u32)?;
        w.write_i64(result.evaluate_time.ticks())?;
        w.write_id_list(&result.observed_input)?;
        w.write_id_list(&result.observed_output)?;
    }
    Ok(())
}

pub fn read_results<R: Read>(
    r: R,
    fs: &mut FileSystemState,
) -> Result<OperationResults, FileReadError> {
    let mut r = Reader { r };
    r.expect_magic(&RESULTS_MAGIC, "operation results")?;
    let table = r.read_file_table(fs)?;

    let count = r.read_u32()?;
    let mut results = OperationResults::default();
    for _ in 0..count {
        let id = OperationId::from_raw(r.read_u32()?);
        let was_successful_run = r.read_u32()? != 0;
        let evaluate_time = Timestamp::from_ticks(r.read_i64()?);
        let observed_input = r.read_id_list(&table)?;
        let observed_output = r.read_id_list(&table)?;
        results.set(
            id,
            OperationResult {
                was_successful_run,
                evaluate_time,
                observed_input,
                observed_output,
            },
        );
    }
    r.expect_eof()?;
    Ok(results)
}

pub fn write_graph_file(
    path: &Path,
    graph: &OperationGraph,
    fs: &FileSystemState,
) -> anyhow::Result<()> {
    let file = std::fs::File::create(path).with_context(|| format!("create {:?}", path))?;
    let mut w = BufWriter::new(file);
    write_graph(&mut w, graph, fs)?;
    w.flush()?;
    Ok(())
}

pub fn read_graph_file(
    path: &Path,
    fs: &mut FileSystemState,
) -> Result<OperationGraph, FileReadError> {
    let file = std::fs::File::open(path).map_err(FileReadError::from)?;
    read_graph(BufReader::new(file), fs)
}

pub fn write_results_file(
    path: &Path,
    results: &OperationResults,
    fs: &FileSystemState,
) -> anyhow::Result<()> {
    let file = std::fs::File::create(path).with_context(|| format!("create {:?}", path))?;
    let mut w = BufWriter::new(file);
    write_results(&mut w, results, fs)?;
    w.flush()?;
    Ok(())
}

/// Load previous operation results, treating anything unreadable the same
/// as an absent file: a cold start where every operation evaluates as
/// having no successful previous invocation.
pub fn load_results_file(
    path: &Path,
    fs: &mut FileSystemState,
    progress: &mut dyn Progress,
) -> OperationResults {
    let file = match std::fs::File::open(path) {
        Ok(file) => file,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            progress.diagnostic("no previous operation results");
            return OperationResults::default();
        }
        Err(err) => {
            progress.warning(&format!(
                "failed to open operation results {:?}, assuming cold build: {}",
                path, err
            ));
            return OperationResults::default();
        }
    };
    match read_results(BufReader::new(file), fs) {
        Ok(results) => results,
        Err(err) => {
            progress.warning(&format!(
                "failed to read operation results {:?}, assuming cold build: {}",
                path, err
            ));
            OperationResults::default()
        }
    }
}
