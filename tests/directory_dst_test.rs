//! Directory DST Integration Tests
//!
//! Multi-seed deterministic simulation of get-or-create and restart
//! sequences, in memory and over a real index file.

use tempfile::TempDir;
use tsdb_node::dst::{
    run_directory_dst_batch, summarize_directory_batch, DirectoryDSTConfig, DirectoryDSTHarness,
};

#[test]
fn test_directory_dst_50_seeds_in_memory() {
    // INVARIANT: a restart recovers exactly the partitions created so far
    let results = run_directory_dst_batch(0, 50, 300, DirectoryDSTConfig::new);
    let summary = summarize_directory_batch(&results);

    for r in &results {
        assert!(
            r.is_success(),
            "Seed {} failed: {:?}",
            r.seed,
            r.invariant_violations
        );
    }

    println!("{}", summary);
}

#[test]
fn test_directory_dst_file_backed() {
    for seed in 0..5u64 {
        let dir = TempDir::new().unwrap();
        let config = DirectoryDSTConfig {
            restart_probability: 0.15,
            ..DirectoryDSTConfig::file_backed(seed, dir.path().to_path_buf())
        };

        let mut harness = DirectoryDSTHarness::new(config);
        harness.run(150);
        harness.check_invariants();

        let result = harness.result();
        assert!(
            result.is_success(),
            "Seed {} failed: {:?}",
            seed,
            result.invariant_violations
        );
        assert!(result.restarts > 0, "Seed {} never restarted", seed);
        println!("{}", result.summary());
    }
}
