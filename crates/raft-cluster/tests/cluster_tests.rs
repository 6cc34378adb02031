//! # threaded cluster tests
//!
//! why: verify the cluster works with real threads, channels and output files
//! relations: spawns raft-cluster runtimes, reads output logs through raft-storage
//! what: console commands end to end, client seeding, crashes, stop and timeouts

use std::fs;
use std::path::Path;
use std::thread;
use std::time::{Duration, Instant};

use raft_cluster::{spawn_cluster, ClusterHandle, ClusterOptions, ConsoleCommand, Outcome};
use raft_core::{ClientConfig, ClusterConfig, ControlKind, RaftConfig, Rank, Topology};
use raft_storage::{read_output_log, server_log_path};
use tempfile::{tempdir, TempDir};

fn fast_config() -> ClusterConfig {
    ClusterConfig {
        raft: RaftConfig {
            election_timeout_min_ms: 50,
            election_timeout_max_ms: 100,
            heartbeat_interval_ms: 10,
            min_tick_ms: 1,
        },
        client: ClientConfig {
            timeout_ms: 50,
            min_tick_ms: 1,
        },
    }
}

fn start(clients: usize, servers: usize, dir: &TempDir) -> ClusterHandle {
    let options = ClusterOptions {
        topology: Topology::new(clients, servers).unwrap(),
        config: fast_config(),
        log_dir: dir.path().join("server_logs"),
        commands_dir: Some(dir.path().join("client_commands")),
        console_timeout: Duration::from_millis(1000),
    };
    spawn_cluster(&options).unwrap()
}

fn run(cluster: &mut ClusterHandle, line: &str) -> Vec<(Rank, Outcome)> {
    let command = cluster.console().parse(line).unwrap();
    cluster.console().execute(&command)
}

fn output(dir: &Path, rank: Rank) -> Vec<String> {
    read_output_log(server_log_path(dir.join("server_logs"), rank)).unwrap_or_default()
}

fn wait_for(timeout: Duration, mut done: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if done() {
            return true;
        }
        thread::sleep(Duration::from_millis(10));
    }
    false
}

// =============================================================================
// SECTION 1: END TO END
// =============================================================================

mod end_to_end {
    use super::*;

    #[test]
    fn console_entry_reaches_every_output_log() {
        let dir = tempdir().unwrap();
        let mut cluster = start(1, 3, &dir);

        assert_eq!(run(&mut cluster, "set_speed 1 high"), vec![(1, Outcome::Ack(true))]);
        assert_eq!(run(&mut cluster, "start_client 1"), vec![(1, Outcome::Ack(true))]);
        assert_eq!(
            run(&mut cluster, "add_log_entry 1 hello   raft world"),
            vec![(1, Outcome::Ack(true))]
        );

        assert!(wait_for(Duration::from_secs(5), || {
            (2..=4).all(|rank| output(dir.path(), rank) == vec!["hello raft world"])
        }));

        let stops = run(&mut cluster, "stop_all");
        assert_eq!(stops.len(), 4);
        assert!(stops.iter().all(|(_, outcome)| *outcome == Outcome::Ack(true)));
        cluster.join();
    }

    #[test]
    fn seeded_and_file_commands_are_replicated_in_order() {
        let dir = tempdir().unwrap();
        let commands = dir.path().join("client_commands");
        fs::create_dir_all(&commands).unwrap();
        fs::write(commands.join("commands_client_1.txt"), "a\nb\n").unwrap();
        let extra = dir.path().join("extra.txt");
        fs::write(&extra, "c\n").unwrap();

        let mut cluster = start(1, 3, &dir);
        run(&mut cluster, "set_speed 1 high");
        run(&mut cluster, "start_client 1");
        let line = format!("add_files_entries 1 {}", extra.display());
        assert_eq!(run(&mut cluster, &line), vec![(1, Outcome::Ack(true))]);

        assert!(wait_for(Duration::from_secs(5), || {
            (2..=4).all(|rank| output(dir.path(), rank) == vec!["a", "b", "c"])
        }));
        cluster.shutdown();
    }

    #[test]
    fn missing_command_file_is_refused() {
        let dir = tempdir().unwrap();
        let mut cluster = start(1, 1, &dir);
        let line = format!("add_files_entries 1 {}", dir.path().join("nope.txt").display());
        assert_eq!(run(&mut cluster, &line), vec![(1, Outcome::Ack(false))]);
        cluster.shutdown();
    }
}

// =============================================================================
// SECTION 2: FAILURES
// =============================================================================

mod failures {
    use super::*;

    #[test]
    fn cluster_commits_with_one_server_crashed() {
        let dir = tempdir().unwrap();
        let mut cluster = start(1, 3, &dir);
        run(&mut cluster, "set_speed 1 high");
        run(&mut cluster, "start_client 1");

        assert_eq!(run(&mut cluster, "crash_process 4"), vec![(4, Outcome::Ack(true))]);
        assert_eq!(run(&mut cluster, "crash_process 4"), vec![(4, Outcome::Ack(false))]);
        run(&mut cluster, "add_log_entry 1 during-crash");

        assert!(wait_for(Duration::from_secs(5), || {
            (2..=3).all(|rank| output(dir.path(), rank) == vec!["during-crash"])
        }));
        assert!(output(dir.path(), 4).is_empty());

        assert_eq!(run(&mut cluster, "recover_process 4"), vec![(4, Outcome::Ack(true))]);
        assert!(wait_for(Duration::from_secs(5), || {
            output(dir.path(), 4) == vec!["during-crash"]
        }));
        cluster.shutdown();
    }

    #[test]
    fn stopped_process_no_longer_answers() {
        let dir = tempdir().unwrap();
        let mut cluster = start(0, 2, &dir);

        assert_eq!(run(&mut cluster, "stop_process 2"), vec![(2, Outcome::Ack(true))]);
        assert!(wait_for(Duration::from_secs(2), || cluster.running() == 1));
        assert_eq!(run(&mut cluster, "display_process 2"), vec![(2, Outcome::TimedOut)]);
        assert_eq!(run(&mut cluster, "display_process 1"), vec![(1, Outcome::Ack(true))]);
        cluster.shutdown();
    }

    #[test]
    fn timeout_server_is_refused_by_non_followers() {
        let dir = tempdir().unwrap();
        let mut cluster = start(0, 1, &dir);

        // a lone server elects itself quickly
        thread::sleep(Duration::from_millis(300));
        let outcome = cluster
            .console()
            .send_and_wait(1, ControlKind::ServerTimeout, "");
        assert_eq!(outcome, Outcome::Ack(false));
        cluster.shutdown();
    }

    #[test]
    fn invalid_commands_are_rejected_before_sending() {
        let dir = tempdir().unwrap();
        let mut cluster = start(1, 1, &dir);

        assert!(cluster.console().parse("start_client 2").is_err());
        assert!(cluster.console().parse("timeout_server 1").is_err());
        assert_eq!(
            cluster.console().parse("timeout_server 2").unwrap(),
            ConsoleCommand::TimeoutServer { rank: 2 }
        );
        cluster.shutdown();
        assert!(output(dir.path(), 2).is_empty());
    }
}
