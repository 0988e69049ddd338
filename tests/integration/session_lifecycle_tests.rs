//! Get-or-create and administrative delete through the session manager.

use std::fs;

use nbhydra::orchestrator::workspace::CONFIG_FILE_NAME;
use nbhydra::AppError;

use super::test_helpers::{harness, harness_with_config, test_config_with};

#[tokio::test]
async fn first_login_assigns_port_provisions_and_spawns() {
    let h = harness(9500, 9510).await;

    let endpoint = h.manager.ensure_session("alice").await.expect("session");
    assert_eq!(endpoint.port, 9500);
    assert_eq!(endpoint.url(), "http://nb.test:9500");

    let layout = h.layout("alice");
    assert!(layout.is_ready(), "workspace should be fully provisioned");
    assert!(layout.config_file.ends_with(CONFIG_FILE_NAME));
    let rendered = fs::read_to_string(&layout.config_file).expect("config");
    assert!(rendered.contains("alice"));
    assert!(rendered.contains("9500"));
    assert!(rendered.contains(&*layout.notebook_dir.to_string_lossy()));

    assert_eq!(h.processes.spawned_ports(), vec![9500]);

    let record = h.repo.find("alice").await.expect("find").expect("record");
    assert_eq!(record.port, 9500);
    assert!(record.pid.is_some());
}

#[tokio::test]
async fn repeated_login_reuses_live_server() {
    let h = harness(9500, 9510).await;

    let first = h.manager.ensure_session("alice").await.expect("first");
    let pid = h.repo.find("alice").await.unwrap().unwrap().pid;

    for _ in 0..3 {
        let again = h.manager.ensure_session("alice").await.expect("again");
        assert_eq!(again, first);
    }

    assert_eq!(h.processes.spawn_count(), 1, "live server must be reused");
    assert_eq!(h.repo.find("alice").await.unwrap().unwrap().pid, pid);
}

#[tokio::test]
async fn two_port_pool_end_to_end() {
    let h = harness(9500, 9502).await;

    let alice = h.manager.ensure_session("alice").await.expect("alice");
    assert_eq!(alice.port, 9500);
    let alice_pid = h.repo.find("alice").await.unwrap().unwrap().pid.unwrap();

    let bob = h.manager.ensure_session("bob").await.expect("bob");
    assert_eq!(bob.port, 9501);

    let carol = h.manager.ensure_session("carol").await;
    assert!(
        matches!(carol, Err(AppError::AllocationExhausted(_))),
        "third user should exhaust the pool: {carol:?}"
    );
    assert!(h.repo.find("carol").await.unwrap().is_none());
    assert!(!h.layout("carol").exists(), "no workspace without a port");

    h.manager.delete_session("alice").await.expect("delete alice");
    assert!(h.repo.find("alice").await.unwrap().is_none());
    assert!(!h.layout("alice").exists(), "workspace should be removed");
    assert_eq!(h.processes.terminated(), vec![alice_pid]);

    let dave = h.manager.ensure_session("dave").await.expect("dave");
    assert_eq!(dave.port, 9500, "freed port should be reused");
}

#[tokio::test]
async fn delete_unknown_user_is_not_found() {
    let h = harness(9500, 9510).await;
    let result = h.manager.delete_session("ghost").await;
    assert!(matches!(result, Err(AppError::NotFound(_))));
}

#[tokio::test]
async fn delete_with_missing_workspace_reports_provisioning_error() {
    let h = harness(9500, 9510).await;
    h.manager.ensure_session("alice").await.expect("session");
    fs::remove_dir_all(&h.layout("alice").root).expect("remove workspace");

    let result = h.manager.delete_session("alice").await;
    assert!(matches!(result, Err(AppError::Provisioning(_))));
    assert!(
        h.repo.find("alice").await.unwrap().is_none(),
        "record is removed before the tree"
    );
}

#[tokio::test]
async fn non_alphanumeric_user_is_rejected() {
    let h = harness(9500, 9510).await;

    for bad in ["", "../etc", "al ice", "bob/x", "ümlaut"] {
        let result = h.manager.ensure_session(bad).await;
        assert!(
            matches!(result, Err(AppError::InvalidUser(_))),
            "{bad:?} should be rejected"
        );
    }
    assert_eq!(h.processes.spawn_count(), 0);
    assert!(h.repo.list().await.unwrap().is_empty());
}

#[tokio::test]
async fn notebooks_are_seeded_from_init_data_dir() {
    let dir = tempfile::tempdir().expect("tempdir");
    let seed = dir.path().join("seed");
    fs::create_dir_all(seed.join("lessons")).unwrap();
    fs::write(seed.join("intro.ipynb"), "{}").unwrap();
    fs::write(seed.join("lessons").join("one.ipynb"), "{\"cells\": []}").unwrap();

    let data_dir = dir.path().join("users");
    let extra = format!("init_data_dir = '{}'", seed.display());
    let config = test_config_with(data_dir.to_str().unwrap(), 9500, 9510, &extra);
    let h = harness_with_config(dir, config).await;

    h.manager.ensure_session("alice").await.expect("session");

    let nb = h.layout("alice").notebook_dir;
    assert_eq!(fs::read_to_string(nb.join("intro.ipynb")).unwrap(), "{}");
    assert_eq!(
        fs::read_to_string(nb.join("lessons").join("one.ipynb")).unwrap(),
        "{\"cells\": []}"
    );
}

#[tokio::test]
async fn partial_workspace_is_completed_in_place() {
    let h = harness(9500, 9510).await;
    let layout = h.layout("alice");
    fs::create_dir_all(&layout.ipython_dir).unwrap();
    fs::write(layout.root.join("leftover.txt"), "x").unwrap();
    assert!(!layout.is_ready());

    h.manager.ensure_session("alice").await.expect("session");

    assert!(layout.is_ready());
    assert_eq!(fs::read_to_string(layout.root.join("leftover.txt")).unwrap(), "x");
}

#[tokio::test]
async fn missing_config_is_rewritten_without_losing_notebooks() {
    let h = harness(9500, 9510).await;
    h.manager.ensure_session("alice").await.expect("first");
    let layout = h.layout("alice");
    let pid = h.repo.find("alice").await.unwrap().unwrap().pid;

    let thesis = layout.notebook_dir.join("thesis.ipynb");
    fs::write(&thesis, "{\"cells\": [1]}").unwrap();
    fs::remove_file(&layout.config_file).unwrap();

    h.manager.ensure_session("alice").await.expect("second");

    assert_eq!(fs::read_to_string(&thesis).unwrap(), "{\"cells\": [1]}");
    assert!(layout.is_ready());
    assert!(fs::read_to_string(&layout.config_file)
        .unwrap()
        .contains("9500"));
    assert_eq!(
        h.repo.find("alice").await.unwrap().unwrap().pid,
        pid,
        "live server is kept"
    );
    assert_eq!(h.processes.spawn_count(), 1);
}

#[tokio::test]
async fn missing_notebook_dir_is_recreated_next_to_user_files() {
    let h = harness(9500, 9510).await;
    h.manager.ensure_session("alice").await.expect("first");
    let layout = h.layout("alice");

    let profile_extra = layout.profile_dir.join("custom.js");
    fs::write(&profile_extra, "// mine").unwrap();
    fs::remove_dir_all(&layout.notebook_dir).unwrap();

    h.manager.ensure_session("alice").await.expect("second");

    assert!(layout.notebook_dir.is_dir());
    assert_eq!(fs::read_to_string(&profile_extra).unwrap(), "// mine");
}

#[tokio::test]
async fn existing_workspace_is_not_touched() {
    let h = harness(9500, 9510).await;
    h.manager.ensure_session("alice").await.expect("first");

    let marker = h.layout("alice").notebook_dir.join("work.ipynb");
    fs::write(&marker, "mine").unwrap();

    let pid = h.repo.find("alice").await.unwrap().unwrap().pid.unwrap();
    h.processes.kill(pid);
    h.manager.ensure_session("alice").await.expect("second");

    assert_eq!(fs::read_to_string(&marker).unwrap(), "mine");
}

#[tokio::test]
async fn spawn_failure_is_surfaced_and_port_kept() {
    let h = harness(9500, 9510).await;
    h.processes.set_fail_spawn(true);

    let result = h.manager.ensure_session("alice").await;
    assert!(matches!(result, Err(AppError::Spawn(_))));

    let record = h.repo.find("alice").await.unwrap().expect("record kept");
    assert_eq!(record.port, 9500);
    assert!(record.pid.is_none());
    assert_eq!(h.processes.spawn_count(), 0, "no automatic retry");

    h.processes.set_fail_spawn(false);
    let endpoint = h.manager.ensure_session("alice").await.expect("retry");
    assert_eq!(endpoint.port, 9500);
    assert_eq!(h.processes.spawn_count(), 1);
}

#[tokio::test]
async fn list_sessions_reports_liveness() {
    let h = harness(9500, 9510).await;
    h.manager.ensure_session("alice").await.unwrap();
    h.manager.ensure_session("bob").await.unwrap();
    let bob_pid = h.repo.find("bob").await.unwrap().unwrap().pid.unwrap();
    h.processes.kill(bob_pid);

    let sessions = h.manager.list_sessions().await.expect("list");
    let summary: Vec<(String, u16, bool)> = sessions
        .into_iter()
        .map(|s| (s.record.user_id, s.record.port, s.alive))
        .collect();
    assert_eq!(
        summary,
        vec![("alice".into(), 9500, true), ("bob".into(), 9501, false)]
    );
}

#[tokio::test]
async fn reconcile_counts_alive_and_stale() {
    let h = harness(9500, 9510).await;
    for user in ["alice", "bob", "carol"] {
        h.manager.ensure_session(user).await.unwrap();
    }
    let carol_pid = h.repo.find("carol").await.unwrap().unwrap().pid.unwrap();
    h.processes.kill(carol_pid);

    let report = h.manager.reconcile().await.expect("reconcile");
    assert_eq!(report.alive, 2);
    assert_eq!(report.stale, 1);
}

#[tokio::test]
async fn server_ignoring_sigterm_is_killed_before_port_is_freed() {
    let h = harness(9500, 9501).await;
    h.manager.ensure_session("alice").await.expect("alice");
    let alice_pid = h.repo.find("alice").await.unwrap().unwrap().pid.unwrap();
    h.processes.set_ignore_sigterm(true);

    h.manager.delete_session("alice").await.expect("delete");

    assert_eq!(h.processes.terminated(), vec![alice_pid]);
    assert_eq!(h.processes.killed(), vec![alice_pid]);
    assert!(!h.manager.list_sessions().await.unwrap().iter().any(|s| s.alive));

    let dave = h.manager.ensure_session("dave").await.expect("dave");
    assert_eq!(dave.port, 9500);
}

#[tokio::test]
async fn unkillable_server_keeps_its_port() {
    let h = harness(9500, 9501).await;
    h.manager.ensure_session("alice").await.expect("alice");
    h.processes.set_ignore_sigterm(true);
    h.processes.set_ignore_sigkill(true);

    let result = h.manager.delete_session("alice").await;
    assert!(matches!(result, Err(AppError::Spawn(_))), "{result:?}");

    let record = h.repo.find("alice").await.unwrap().expect("record kept");
    assert_eq!(record.port, 9500);
    assert!(h.layout("alice").is_ready(), "workspace kept");

    let dave = h.manager.ensure_session("dave").await;
    assert!(
        matches!(dave, Err(AppError::AllocationExhausted(_))),
        "port still held by alice's server: {dave:?}"
    );
}
