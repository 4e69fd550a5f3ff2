use criterion::{criterion_group, criterion_main, Criterion};
use girder::db::{read_graph, write_graph};
use girder::fs::FileSystemState;
use girder::graph::{CommandInfo, OperationGraph, OperationId, OperationInfo};
use std::io::Cursor;
use std::path::{Path, PathBuf};

fn synthetic_graph(ops: u32) -> (FileSystemState, OperationGraph) {
    let mut fs = FileSystemState::new();
    let work = Path::new("/work");
    let mut operations = Vec::new();
    for i in 1..=ops {
        let input = fs.to_file_id(Path::new(&format!("src/long/file/name{}.cc", i)), work);
        let output = fs.to_file_id(Path::new(&format!("out/foo/bar{}.o", i)), work);
        operations.push(OperationInfo {
            id: OperationId::from_raw(i),
            title: format!("compile bar{}.o", i),
            command: CommandInfo {
                working_directory: work.to_owned(),
                executable: PathBuf::from("/usr/bin/cc"),
                arguments: format!("-c src/long/file/name{}.cc -o out/foo/bar{}.o", i, i),
            },
            declared_input: vec![input],
            declared_output: vec![output],
            read_access: Vec::new(),
            write_access: Vec::new(),
            children: if i < ops {
                vec![OperationId::from_raw(i + 1)]
            } else {
                Vec::new()
            },
            dependency_count: if i > 1 { 1 } else { 0 },
        });
    }
    let graph = OperationGraph::new(vec![OperationId::from_raw(1)], operations);
    (fs, graph)
}

pub fn bench_graph_codec(c: &mut Criterion) {
    let (fs, graph) = synthetic_graph(1000);

    c.bench_function("write graph 1000", |b| {
        b.iter(|| {
            let mut buf = Vec::new();
            write_graph(&mut buf, &graph, &fs).unwrap();
            buf
        })
    });

    let mut buf = Vec::new();
    write_graph(&mut buf, &graph, &fs).unwrap();
    c.bench_function("read graph 1000", |b| {
        b.iter(|| {
            let mut fs = FileSystemState::new();
            read_graph(Cursor::new(&buf), &mut fs).unwrap()
        })
    });
}

criterion_group!(benches, bench_graph_codec);
criterion_main!(benches);
