//! ---
//! mh_section: "08-testing-qa"
//! mh_subsection: "integration-tests"
//! mh_type: "source"
//! mh_scope: "code"
//! mh_description: "Per-host serialisation of tests with overlapping host sets."
//! mh_version: "v0.1.0"
//! mh_owner: "tbd"
//! ---
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;

use mh_common::RetryPolicy;
use mh_isolation::HookRegistry;
use mh_registry::ScriptedTransportFactory;
use mh_runner::{RoleRequest, RunContext};
use mh_session::Recorder;
use mh_topology::{Role, Topology};

const LAB: &str = r#"
domains:
- id: idm
  hosts:
  - name: client1
    hostname: client1.idm.test
    role: client
    ssh: { password_env: MH_SSH_PASSWORD }
  - name: client2
    hostname: client2.idm.test
    role: client
    ssh: { password_env: MH_SSH_PASSWORD }
  - name: nfs1
    hostname: nfs1.idm.test
    role: nfs
    ssh: { private_key: /etc/mh/keys/nfs1 }
"#;

fn recording_run(recorder: Recorder) -> RunContext {
    let topology = Topology::from_str(LAB).expect("lab topology is valid");
    let factory = Arc::new(ScriptedTransportFactory::with_configure(
        move |_, transport| {
            transport
                .with_recorder(recorder.clone())
                .with_exec_delay(Duration::from_millis(5))
        },
    ));
    RunContext::new(
        &topology,
        factory,
        RetryPolicy::immediate(),
        HookRegistry::new(),
    )
}

/// Two tests requiring the same role touch the same two hosts. Because a
/// context holds its per-host leases for its whole lifetime, the recorded
/// command stream on each host must show at most one changeover between
/// the two tests, never an interleaving.
#[tokio::test]
async fn overlapping_tests_never_interleave_on_a_host() {
    let recorder: Recorder = Arc::new(Mutex::new(Vec::new()));
    let run = Arc::new(recording_run(recorder.clone()));

    let mut tasks = Vec::new();
    for tag in ["alpha", "beta"] {
        let run = run.clone();
        tasks.push(tokio::spawn(async move {
            let mut ctx = run
                .test_context(&[RoleRequest::required(Role::Client)])
                .await
                .expect("clients present");
            let hosts = ctx.hosts();
            for step in 1..=3 {
                for host in &hosts {
                    ctx.execute(host, &format!("{tag} step {step}"), Duration::from_secs(5))
                        .await
                        .expect("scripted exec");
                }
            }
            ctx.teardown().await;
        }));
    }
    for task in tasks {
        task.await.expect("test task completes");
    }

    let events = recorder.lock().clone();
    for host in ["idm/client1", "idm/client2"] {
        let tags: Vec<&str> = events
            .iter()
            .filter(|(h, _)| h == host)
            .map(|(_, command)| command.split(' ').next().unwrap())
            .collect();
        assert_eq!(tags.len(), 6, "both tests ran all steps on {host}");
        let changeovers = tags.windows(2).filter(|pair| pair[0] != pair[1]).count();
        assert!(
            changeovers <= 1,
            "commands interleaved on {host}: {tags:?}"
        );
    }
}

/// Tests with disjoint host sets need no coordination: one context can run
/// while another holds unrelated hosts.
#[tokio::test]
async fn disjoint_tests_proceed_concurrently() {
    let recorder: Recorder = Arc::new(Mutex::new(Vec::new()));
    let run = Arc::new(recording_run(recorder));

    let mut client_ctx = run
        .test_context(&[RoleRequest::required(Role::Client)])
        .await
        .unwrap();
    let mut nfs_ctx = run
        .test_context(&[RoleRequest::required(Role::Nfs)])
        .await
        .expect("nfs lease acquired while clients are held");

    let nfs_host = nfs_ctx.host_for_role(Role::Nfs).cloned().unwrap();
    nfs_ctx
        .execute(&nfs_host, "exportfs -ra", Duration::from_secs(5))
        .await
        .expect("nfs exec while clients held elsewhere");

    let client_host = client_ctx.host_for_role(Role::Client).cloned().unwrap();
    client_ctx
        .execute(&client_host, "systemctl restart sssd", Duration::from_secs(5))
        .await
        .expect("client exec");

    nfs_ctx.teardown().await;
    client_ctx.teardown().await;
}
