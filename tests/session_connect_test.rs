//! The session connect protocol against a scripted shell: `su -`, screen
//! attach, and prompt tracking.

mod common;

use common::{FakeConnector, FakeHost, HOST};
use fleet_serve::config::RemoteHost;
use fleet_serve::session::{BashDialect, PersistentSession, SessionOptions, SessionPhase};
use std::sync::Arc;
use std::time::Duration;

const TIMEOUT: Duration = Duration::from_secs(10);

fn session(root_password: Option<&str>, job_container: bool) -> PersistentSession {
    let mut host = RemoteHost::new(HOST, "10.0.0.5", "ops");
    host.root_password = root_password.map(str::to_string);
    let options = SessionOptions {
        escalate: true,
        job_container,
        ..SessionOptions::default()
    };
    PersistentSession::new(host, Arc::new(BashDialect), options)
}

/// Position of each needle in the host's command log, in order.
fn positions(host: &FakeHost, needles: &[&str]) -> Vec<usize> {
    let commands = host.commands();
    needles
        .iter()
        .map(|needle| {
            commands
                .iter()
                .position(|c| c.starts_with(needle))
                .unwrap_or_else(|| panic!("`{}` never ran: {:?}", needle, commands))
        })
        .collect()
}

#[tokio::test(start_paused = true)]
async fn escalates_and_attaches_job_container() {
    let host = FakeHost::new(HOST);
    host.set_root_password("hunter2");
    host.install_screen();
    let connector = FakeConnector::new(&[host.clone()]);

    let mut session = session(Some("hunter2"), true);
    session.connect(connector.as_ref()).await.unwrap();

    assert!(session.is_privileged());
    assert_eq!(session.phase(), SessionPhase::JobContainerReady);
    let container = session.job_container().unwrap().to_string();
    assert!(container.starts_with("fleet_"), "{}", container);

    let status = session.status();
    assert!(status.connected);
    assert!(status.privileged);
    assert_eq!(status.job_container.as_deref(), Some(container.as_str()));

    // Privilege check, escalation, re-check, then the screen handshake.
    let order = positions(
        &host,
        &["whoami", "su -", "screen -dmS", "screen -r", "echo \"STY=$STY\""],
    );
    assert!(order.windows(2).all(|w| w[0] < w[1]), "{:?}", host.commands());
    assert_eq!(host.count_matching("whoami"), 2);
    assert!(host.commands().iter().all(|c| !c.contains("hunter2")));

    let out = session.execute("whoami", TIMEOUT).await;
    assert_eq!(out.stdout, "root");
    assert_eq!(session.last_prompt(), Some("root@gpu-a:~#"));
}

#[tokio::test(start_paused = true)]
async fn rejected_password_continues_unprivileged() {
    let host = FakeHost::new(HOST);
    host.set_root_password("hunter2");
    let connector = FakeConnector::new(&[host.clone()]);

    let mut session = session(Some("wrong"), false);
    session.connect(connector.as_ref()).await.unwrap();

    assert!(!session.is_privileged());
    assert_eq!(session.phase(), SessionPhase::PrivilegeChecked);
    assert_eq!(session.job_container(), None);
    assert_eq!(host.count_matching("su -"), 1);

    // The shell is still usable after the failed dialog.
    let out = session.execute("whoami", TIMEOUT).await;
    assert!(out.success());
    assert_eq!(out.stdout, "ops");
}

#[tokio::test(start_paused = true)]
async fn missing_screen_stops_at_privilege_checked() {
    let host = FakeHost::new(HOST);
    let connector = FakeConnector::new(&[host.clone()]);

    let mut session = session(None, true);
    session.connect(connector.as_ref()).await.unwrap();

    assert_eq!(session.phase(), SessionPhase::PrivilegeChecked);
    assert_eq!(session.job_container(), None);
    assert_eq!(host.count_matching("su -"), 0);
    assert_eq!(host.count_matching("screen -r"), 0);
}

#[tokio::test(start_paused = true)]
async fn escalate_with_upgrades_a_connected_session() {
    let host = FakeHost::new(HOST);
    host.set_root_password("hunter2");
    let connector = FakeConnector::new(&[host.clone()]);

    let mut session = session(None, false);
    session.connect(connector.as_ref()).await.unwrap();
    assert!(!session.is_privileged());

    assert!(!session.escalate_with("nope").await);
    assert!(session.escalate_with("hunter2").await);
    assert!(session.is_privileged());
    assert_eq!(host.count_matching("su -"), 2);
}

#[tokio::test(start_paused = true)]
async fn prompt_is_forgotten_when_a_command_is_not_echoed() {
    let host = FakeHost::new(HOST);
    let connector = FakeConnector::new(&[host.clone()]);

    let mut session = session(None, false);
    session.connect(connector.as_ref()).await.unwrap();

    session.execute("echo ok", TIMEOUT).await;
    assert_eq!(session.last_prompt(), Some("ops@gpu-a:~$"));

    session.execute("stty -echo", TIMEOUT).await;
    let out = session.execute("echo ok", TIMEOUT).await;
    assert_eq!(out.stdout, "ok");
    assert_eq!(session.last_prompt(), None);
}

#[tokio::test(start_paused = true)]
async fn timed_out_command_is_interrupted_and_session_recovers() {
    let host = FakeHost::new(HOST);
    let connector = FakeConnector::new(&[host.clone()]);

    let mut session = session(None, false);
    session.connect(connector.as_ref()).await.unwrap();

    let out = session.execute("sleep infinity", Duration::from_secs(2)).await;
    assert_eq!(out.exit_code, -1);
    assert!(out.stderr.contains("no completion marker"), "{}", out.stderr);
    assert!(session.is_live());

    let out = session.execute("echo ok", TIMEOUT).await;
    assert!(out.success(), "{:?}", out);
    assert_eq!(out.stdout, "ok");
}
