//! Concurrency stress scenarios for the coordinator.
//!
//! These drive many simultaneous operations through the public API and
//! check the structural invariants: unique names per directory, a single
//! surviving entry under creator races, and clean rejection after stop.

use std::sync::Arc;

use meshfs_core::meta::MetadataManager;
use meshfs_core::{FileId, MeshFsError, MeshPath};

use crate::harness::TestBed;

/// Outcome summary of one stress run.
#[derive(Debug, Default, Clone)]
pub struct StressOutcome {
    /// Operations that completed successfully.
    pub succeeded: u64,
    /// Operations rejected with a domain error.
    pub rejected: u64,
    /// Operations that failed with `IllegalState` during shutdown.
    pub stopped: u64,
}

impl StressOutcome {
    /// Total operations attempted.
    pub fn total(&self) -> u64 {
        self.succeeded + self.rejected + self.stopped
    }
}

/// Runs `tasks` concurrent mkdirs of the same chain and returns the
/// aggregate outcome.
pub async fn concurrent_mkdirs(bed: &TestBed, tasks: usize, path: &MeshPath) -> StressOutcome {
    let mut handles = Vec::with_capacity(tasks);

    for _ in 0..tasks {
        let fs = bed.fs.clone();
        let path = path.clone();
        handles.push(tokio::spawn(async move { fs.mkdirs(&path).await }));
    }

    let mut outcome = StressOutcome::default();

    for handle in handles {
        match handle.await.expect("task must not panic") {
            Ok(()) => outcome.succeeded += 1,
            Err(MeshFsError::IllegalState(_)) => outcome.stopped += 1,
            Err(_) => outcome.rejected += 1,
        }
    }

    outcome
}

#[cfg(test)]
mod tests {
    use super::*;

    fn p(s: &str) -> MeshPath {
        MeshPath::new(s).unwrap()
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_mkdirs_yield_one_chain() {
        let bed = TestBed::start(false).await;

        let outcome = concurrent_mkdirs(&bed, 16, &p("/x/y/z")).await;
        assert_eq!(outcome.succeeded, 16);

        // Exactly one entry per level.
        let root_listing = bed.meta.directory_listing(FileId::ROOT).await.unwrap();
        assert_eq!(root_listing.len(), 1);
        assert!(root_listing.contains_key("x"));

        let x = root_listing["x"].file_id;
        let x_listing = bed.meta.directory_listing(x).await.unwrap();
        assert_eq!(x_listing.len(), 1);
        assert!(x_listing.contains_key("y"));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_distinct_creates_all_land() {
        let bed = TestBed::start(false).await;

        let mut handles = Vec::new();

        for i in 0..24 {
            let fs = bed.fs.clone();
            handles.push(tokio::spawn(async move {
                let path = MeshPath::new(&format!("/data/file-{i}")).unwrap();
                let mut w = fs.create(&path, false).await?;
                w.write(format!("content-{i}").as_bytes()).await?;
                w.close().await?;
                Ok::<_, MeshFsError>(())
            }));
        }

        for handle in handles {
            handle.await.unwrap().unwrap();
        }

        let listing = bed.fs.list_paths(&p("/data")).await.unwrap();
        assert_eq!(listing.len(), 24);

        for i in 0..24 {
            let content = bed
                .read_file(&MeshPath::new(&format!("/data/file-{i}")).unwrap())
                .await
                .unwrap();
            assert_eq!(content, format!("content-{i}").as_bytes());
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn overwrite_stress_keeps_single_entry() {
        let bed = TestBed::start(false).await;
        let path = p("/contested");

        let mut handles = Vec::new();

        for i in 0..8 {
            let fs = bed.fs.clone();
            let path = path.clone();
            handles.push(tokio::spawn(async move {
                let mut w = fs.create(&path, true).await?;
                w.write(format!("writer-{i}").as_bytes()).await?;
                w.close().await?;
                Ok::<_, MeshFsError>(())
            }));
        }

        let mut succeeded = 0;
        for handle in handles {
            if handle.await.unwrap().is_ok() {
                succeeded += 1;
            }
        }

        assert!(succeeded >= 1, "at least one writer must win");

        let listing = bed.meta.directory_listing(FileId::ROOT).await.unwrap();
        let entries: Vec<_> = listing.keys().filter(|n| n.as_str() == "contested").collect();
        assert_eq!(entries.len(), 1);

        let content = bed.read_file(&path).await.unwrap();
        assert!(content.starts_with(b"writer-"), "unexpected content {content:?}");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn stop_under_load_rejects_cleanly() {
        let bed = TestBed::start(false).await;
        let fs = Arc::clone(&bed.fs);

        let mut handles = Vec::new();

        for i in 0..32 {
            let fs = fs.clone();
            handles.push(tokio::spawn(async move {
                let path = MeshPath::new(&format!("/burst/f{i}")).unwrap();
                let mut w = fs.create(&path, true).await?;
                w.write(b"x").await?;
                w.close().await?;
                Ok::<_, MeshFsError>(())
            }));
        }

        bed.fs.stop().await;

        for handle in handles {
            match handle.await.unwrap() {
                Ok(()) | Err(MeshFsError::IllegalState(_)) => {}
                Err(other) => panic!("unexpected failure during shutdown: {other}"),
            }
        }

        // Once stopped, everything is rejected.
        assert!(matches!(
            bed.fs.mkdirs(&p("/late")).await,
            Err(MeshFsError::IllegalState(_))
        ));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn mixed_operations_keep_summary_consistent() {
        let bed = TestBed::start(false).await;

        for i in 0..6 {
            bed.write_file(&MeshPath::new(&format!("/mix/a/f{i}")).unwrap(), b"12345")
                .await
                .unwrap();
        }

        bed.fs.mkdirs(&p("/mix/empty")).await.unwrap();
        assert!(bed.fs.delete(&p("/mix/a/f0"), false).await.unwrap());
        bed.fs
            .rename(&p("/mix/a/f1"), &p("/mix/renamed"))
            .await
            .unwrap();

        let summary = bed.fs.summary(&p("/mix")).await.unwrap();
        assert_eq!(summary.files_count, 5); // 4 left in /mix/a plus the renamed one.
        assert_eq!(summary.directories_count, 3); // /mix, /mix/a, /mix/empty.
        assert_eq!(summary.total_length, 25);
    }
}
