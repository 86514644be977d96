//! Scripted stand-in for a remote GPU host.
//!
//! [`FakeHost`] answers the commands the orchestrator sends, keeping just
//! enough state (live pids, bound ports, the active conda environment) for
//! tests to see the effects of launches and signals. [`FakeConnector`]
//! serves it both as a one-shot exec channel and as an interactive shell.

#![allow(dead_code)]

use async_trait::async_trait;
use fleet_serve::config::{Config, RemoteHost, ServiceSpec};
use fleet_serve::transport::{CommandOutput, Connection, Connector, ShellChannel, TransportError};
use fleet_serve::Orchestrator;
use parking_lot::Mutex;
use regex::Regex;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

pub const HOST: &str = "gpu-a";
pub const CONDA: &str = "/opt/miniconda3/bin/conda";

/// What the next launch command does.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LaunchBehavior {
    /// Server starts and binds its port right away.
    Healthy,
    /// Server stays alive but never binds.
    NeverBinds,
    /// Server dies before binding.
    Exits,
    /// The launch command itself fails.
    Rejected,
}

#[derive(Debug)]
struct HostState {
    alive: BTreeSet<u32>,
    /// Bound ports and their owner, if visible.
    bound: BTreeMap<u16, Option<u32>>,
    next_pid: u32,
    launch: LaunchBehavior,
    unreachable: bool,
    active_env: Option<String>,
    /// Overrides what `conda info` reports as the active environment.
    tool_reports: Option<String>,
    /// Processes that ignore SIGTERM.
    stubborn: BTreeSet<u32>,
    /// Credential `su -` accepts. `None` rejects every attempt.
    root_password: Option<String>,
    screen_installed: bool,
    /// Checkpoint directories and their `config.json`, if any.
    models: BTreeMap<String, Option<String>>,
}

pub struct FakeHost {
    pub name: String,
    state: Mutex<HostState>,
    commands: Mutex<Vec<String>>,
}

impl FakeHost {
    pub fn new(name: &str) -> Arc<Self> {
        Arc::new(Self {
            name: name.to_string(),
            state: Mutex::new(HostState {
                alive: BTreeSet::new(),
                bound: BTreeMap::new(),
                next_pid: 4000,
                launch: LaunchBehavior::Healthy,
                unreachable: false,
                active_env: None,
                tool_reports: None,
                stubborn: BTreeSet::new(),
                root_password: None,
                screen_installed: false,
                models: BTreeMap::new(),
            }),
            commands: Mutex::new(Vec::new()),
        })
    }

    pub fn set_launch(&self, behavior: LaunchBehavior) {
        self.state.lock().launch = behavior;
    }

    pub fn set_unreachable(&self, unreachable: bool) {
        self.state.lock().unreachable = unreachable;
    }

    pub fn set_tool_reports(&self, env: &str) {
        self.state.lock().tool_reports = Some(env.to_string());
    }

    /// Occupy a port with a process the orchestrator did not start.
    pub fn bind_foreign(&self, port: u16, pid: Option<u32>) {
        let mut state = self.state.lock();
        state.bound.insert(port, pid);
        if let Some(pid) = pid {
            state.alive.insert(pid);
        }
    }

    pub fn set_root_password(&self, password: &str) {
        self.state.lock().root_password = Some(password.to_string());
    }

    pub fn install_screen(&self) {
        self.state.lock().screen_installed = true;
    }

    /// A checkpoint directory with safetensors weights and an optional config.
    pub fn add_model(&self, dir: &str, config: Option<&str>) {
        self.state
            .lock()
            .models
            .insert(dir.to_string(), config.map(str::to_string));
    }

    pub fn make_stubborn(&self, pid: u32) {
        self.state.lock().stubborn.insert(pid);
    }

    /// The process dies on its own.
    pub fn crash(&self, pid: u32) {
        let mut state = self.state.lock();
        state.alive.remove(&pid);
        state.bound.retain(|_, owner| *owner != Some(pid));
    }

    pub fn is_alive(&self, pid: u32) -> bool {
        self.state.lock().alive.contains(&pid)
    }

    pub fn is_bound(&self, port: u16) -> bool {
        self.state.lock().bound.contains_key(&port)
    }

    pub fn commands(&self) -> Vec<String> {
        self.commands.lock().clone()
    }

    pub fn command_count(&self) -> usize {
        self.commands.lock().len()
    }

    pub fn count_matching(&self, needle: &str) -> usize {
        self.commands
            .lock()
            .iter()
            .filter(|c| c.contains(needle))
            .count()
    }

    fn record(&self, command: &str) {
        self.commands.lock().push(command.to_string());
    }

    fn screen_installed(&self) -> bool {
        self.state.lock().screen_installed
    }

    fn accepts_root_password(&self, attempt: &str) -> bool {
        self.state.lock().root_password.as_deref() == Some(attempt)
    }

    /// Answer one command line.
    pub fn respond(&self, command: &str) -> CommandOutput {
        self.record(command);
        let mut state = self.state.lock();
        if state.unreachable {
            return CommandOutput::failure(TransportError::Connect("no route to host".into()));
        }

        if command.contains("& PID=$!") {
            return launch(&mut state, command);
        }
        if command.starts_with("(ss -Htln") {
            let port = number_after(command, r"\[:\.\](\d+)\$").unwrap_or_default() as u16;
            return exit_ok(state.bound.contains_key(&port));
        }
        if command.starts_with("lsof ") {
            let port = number_after(command, r"-iTCP:(\d+)").unwrap_or_default() as u16;
            return match state.bound.get(&port) {
                Some(Some(pid)) => CommandOutput::ok(format!("p{}\ncpython3\n", pid)),
                _ => CommandOutput::new(1, "", ""),
            };
        }
        if command.starts_with("kill -0 ") {
            let pid = number_after(command, r"kill -0 (\d+)").unwrap_or_default();
            return exit_ok(state.alive.contains(&pid));
        }
        if let Some(rest) = command.strip_prefix("kill -") {
            let (signal, pid) = rest.split_once(' ').unwrap_or(("", ""));
            let pid: u32 = pid.trim().parse().unwrap_or_default();
            if !state.alive.contains(&pid) {
                return CommandOutput::new(1, "", format!("kill: ({}) - No such process", pid));
            }
            if signal == "KILL" || !state.stubborn.contains(&pid) {
                state.alive.remove(&pid);
                state.bound.retain(|_, owner| *owner != Some(pid));
            }
            return CommandOutput::ok("");
        }
        if command.starts_with("tail -n ") {
            return CommandOutput::ok("INFO loading weights\nERROR CUDA out of memory\n");
        }
        if command.starts_with("find ") {
            let listing: String = state
                .models
                .iter()
                .filter(|(dir, _)| command.contains(&format!("find {} ", parent_of(dir))))
                .flat_map(|(dir, config)| {
                    let mut files = vec![format!("{}/model.safetensors\n", dir)];
                    if config.is_some() {
                        files.insert(0, format!("{}/config.json\n", dir));
                    }
                    files
                })
                .collect();
            return CommandOutput::ok(listing);
        }
        if let Some(dir) = command.strip_prefix("du -sm ") {
            return match state.models.contains_key(dir) {
                true => CommandOutput::ok(format!("15234\t{}\n", dir)),
                false => CommandOutput::new(1, "", format!("du: cannot access '{}'", dir)),
            };
        }
        if let Some(path) = command.strip_prefix("cat ") {
            let config = path
                .strip_suffix("/config.json")
                .and_then(|dir| state.models.get(dir).cloned().flatten());
            return match config {
                Some(json) => CommandOutput::ok(json),
                None => CommandOutput::new(1, "", ""),
            };
        }
        if command == "whoami" {
            return CommandOutput::ok("ops\n");
        }
        if command == "echo ok" {
            return CommandOutput::ok("ok\n");
        }
        if command.starts_with("for c in ") {
            return CommandOutput::ok(format!("{}\n", CONDA));
        }
        if command.ends_with(" env list") {
            return CommandOutput::ok(
                "# conda environments:\n#\nbase  *  /opt/miniconda3\nvllm     /opt/miniconda3/envs/vllm\n",
            );
        }
        if command.starts_with("source ") {
            let env = command.rsplit(' ').next().unwrap_or_default().to_string();
            if env == "vllm" || env == "base" {
                state.active_env = Some(env);
                return CommandOutput::ok("");
            }
            return CommandOutput::new(1, "", "EnvironmentNameNotFound");
        }
        if command.starts_with("echo \"PS1=") {
            let env = state.active_env.clone().unwrap_or_default();
            let prefix = if env.is_empty() {
                String::new()
            } else {
                format!("/opt/miniconda3/envs/{}", env)
            };
            let mut out = format!("PS1=\nENV={}\nPREFIX={}\n", env, prefix);
            if command.contains(" info ") {
                let tool = state.tool_reports.clone().unwrap_or(env);
                out.push_str(&format!("     active environment : {}\n", tool));
            }
            return CommandOutput::ok(out);
        }
        if command.starts_with("screen -dmS") {
            if state.screen_installed {
                return CommandOutput::ok("");
            }
            return CommandOutput::new(127, "", "screen: command not found");
        }
        if command.starts_with("ps -eo") {
            let lines: Vec<String> = state
                .bound
                .iter()
                .filter_map(|(port, owner)| owner.map(|pid| (pid, *port)))
                .map(|(pid, port)| {
                    format!(
                        "{} python -m vllm.entrypoints.openai.api_server --model /models/qwen --port {}",
                        pid, port
                    )
                })
                .collect();
            return CommandOutput::ok(lines.join("\n"));
        }
        CommandOutput::ok("")
    }

    fn prompt(&self, user: &str) -> String {
        let sigil = if user == "root" { '#' } else { '$' };
        match &self.state.lock().active_env {
            Some(env) => format!("({}) {}@{}:~{} ", env, user, self.name, sigil),
            None => format!("{}@{}:~{} ", user, self.name, sigil),
        }
    }
}

fn launch(state: &mut HostState, command: &str) -> CommandOutput {
    let port = number_after(command, r"--port (\d+)").unwrap_or_default() as u16;
    if state.launch == LaunchBehavior::Rejected {
        return CommandOutput::new(1, "", "/usr/bin/python: No module named vllm");
    }
    state.next_pid += 1;
    let pid = state.next_pid;
    match state.launch {
        LaunchBehavior::Healthy => {
            state.alive.insert(pid);
            state.bound.insert(port, Some(pid));
        }
        LaunchBehavior::NeverBinds => {
            state.alive.insert(pid);
        }
        LaunchBehavior::Exits | LaunchBehavior::Rejected => {}
    }
    CommandOutput::ok(format!("{}\n", pid))
}

fn parent_of(dir: &str) -> &str {
    dir.rsplit_once('/').map(|(parent, _)| parent).unwrap_or_default()
}

fn exit_ok(ok: bool) -> CommandOutput {
    CommandOutput::new(if ok { 0 } else { 1 }, "", "")
}

fn number_after(text: &str, pattern: &str) -> Option<u32> {
    Regex::new(pattern)
        .ok()?
        .captures(text)?
        .get(1)?
        .as_str()
        .parse()
        .ok()
}

/// Serves fake hosts by name and counts what gets opened.
pub struct FakeConnector {
    hosts: HashMap<String, Arc<FakeHost>>,
    pub connects: AtomicUsize,
    shells: Arc<AtomicUsize>,
    /// Time each connect takes, to widen race windows.
    pub delay: Duration,
}

impl FakeConnector {
    pub fn new(hosts: &[Arc<FakeHost>]) -> Arc<Self> {
        Self::with_delay(hosts, Duration::ZERO)
    }

    pub fn with_delay(hosts: &[Arc<FakeHost>], delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            hosts: hosts.iter().map(|h| (h.name.clone(), Arc::clone(h))).collect(),
            connects: AtomicUsize::new(0),
            shells: Arc::new(AtomicUsize::new(0)),
            delay,
        })
    }

    pub fn shells_opened(&self) -> usize {
        self.shells.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Connector for FakeConnector {
    async fn connect(&self, host: &RemoteHost) -> Result<Arc<dyn Connection>, TransportError> {
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        let fake = self
            .hosts
            .get(&host.name)
            .cloned()
            .ok_or_else(|| TransportError::Connect(format!("unknown host {}", host.name)))?;
        if fake.state.lock().unreachable {
            return Err(TransportError::Connect("no route to host".into()));
        }
        self.connects.fetch_add(1, Ordering::SeqCst);
        Ok(Arc::new(FakeConnection {
            host: fake,
            shells: Arc::clone(&self.shells),
        }))
    }
}

struct FakeConnection {
    host: Arc<FakeHost>,
    shells: Arc<AtomicUsize>,
}

#[async_trait]
impl Connection for FakeConnection {
    async fn exec(&self, command: &str) -> Result<CommandOutput, TransportError> {
        let out = self.host.respond(command);
        match out.transport_error() {
            Some(e) => Err(e),
            None => Ok(out),
        }
    }

    async fn open_shell(&self) -> Result<Box<dyn ShellChannel>, TransportError> {
        self.shells.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(FakeShell {
            host: Arc::clone(&self.host),
            pending: format!("Welcome to {}\n{}", self.host.name, self.host.prompt("ops")),
            input: String::new(),
            last_code: 0,
            user: "ops",
            awaiting_password: false,
            echo: true,
            sty: None,
            busy: false,
        }))
    }

    async fn probe(&self) -> bool {
        !self.host.state.lock().unreachable
    }

    async fn close(&self) {}
}

/// Line-buffered terminal over a [`FakeHost`]. Echoes input after the
/// prompt, like a real pty, and plays the `su -` and `screen -r` dialogs
/// itself since they change the shell rather than the host.
struct FakeShell {
    host: Arc<FakeHost>,
    pending: String,
    input: String,
    last_code: i32,
    user: &'static str,
    awaiting_password: bool,
    echo: bool,
    /// `$STY` once a screen session is attached.
    sty: Option<String>,
    /// A foreground command holds the terminal until Ctrl-C.
    busy: bool,
}

impl FakeShell {
    fn handle_line(&mut self, line: &str) {
        let line = line.trim_end_matches('\r');
        if self.awaiting_password {
            self.awaiting_password = false;
            self.answer_password(line);
            return;
        }
        if self.busy || line == "\x03" || line.is_empty() {
            return;
        }
        if self.echo {
            self.pending
                .push_str(&format!("{}{}\n", self.host.prompt(self.user), line));
        }

        if let Some(token) = line
            .strip_prefix("echo \"__FLEET_DONE_\"\"")
            .and_then(|rest| rest.strip_suffix(":$?\""))
        {
            self.pending
                .push_str(&format!("__FLEET_DONE_{}:{}\n", token, self.last_code));
            return;
        }

        if self.handle_builtin(line) {
            return;
        }

        let out = self.host.respond(line);
        self.write_output(&out);
    }

    /// Commands that act on this shell rather than on the host.
    fn handle_builtin(&mut self, line: &str) -> bool {
        let out = match line {
            "whoami" => CommandOutput::ok(format!("{}\n", self.user)),
            "su -" => {
                self.host.record(line);
                self.pending.push_str("Password: ");
                self.awaiting_password = true;
                return true;
            }
            "sleep infinity" => {
                self.host.record(line);
                self.busy = true;
                return true;
            }
            "stty -echo" => {
                self.echo = false;
                CommandOutput::ok("")
            }
            "echo \"STY=$STY\"" => {
                CommandOutput::ok(format!("STY={}\n", self.sty.as_deref().unwrap_or_default()))
            }
            _ => match line.strip_prefix("screen -r ") {
                Some(name) if self.host.screen_installed() => {
                    self.sty = Some(format!("12345.{}", name));
                    self.pending.push_str(&self.host.prompt(self.user));
                    CommandOutput::ok("")
                }
                _ => return false,
            },
        };
        self.host.record(line);
        self.write_output(&out);
        true
    }

    /// The password line is neither echoed nor recorded.
    fn answer_password(&mut self, attempt: &str) {
        if self.host.accepts_root_password(attempt) {
            self.user = "root";
            self.pending.push('\n');
        } else {
            self.pending.push_str("\nsu: Authentication failure\n");
        }
        self.pending.push_str(&self.host.prompt(self.user));
    }

    fn write_output(&mut self, out: &CommandOutput) {
        if !out.stdout.is_empty() {
            self.pending.push_str(&out.stdout);
            if !out.stdout.ends_with('\n') {
                self.pending.push('\n');
            }
        }
        if !out.stderr.is_empty() {
            self.pending.push_str(&format!("{}\n", out.stderr));
        }
        self.last_code = if out.is_transport_failure() { 255 } else { out.exit_code };
    }
}

#[async_trait]
impl ShellChannel for FakeShell {
    async fn send(&mut self, data: &str) -> Result<(), TransportError> {
        if data == "\x03" {
            if self.busy {
                self.busy = false;
                self.last_code = 130;
                self.pending.push_str(&format!("^C\n{}", self.host.prompt(self.user)));
            }
            return Ok(());
        }
        self.input.push_str(data);
        while let Some(idx) = self.input.find('\n') {
            let line: String = self.input.drain(..=idx).collect();
            self.handle_line(line.trim_end_matches('\n'));
        }
        Ok(())
    }

    async fn recv(&mut self, wait: Duration) -> Result<Option<String>, TransportError> {
        if self.pending.is_empty() {
            tokio::time::sleep(wait).await;
            return Ok(None);
        }
        Ok(Some(std::mem::take(&mut self.pending)))
    }

    async fn close(&mut self) {}
}

/// One host, quick timeouts, no screen, no escalation.
pub fn config(services: &[(&str, Option<&str>)]) -> Config {
    let mut config = Config::default();
    let mut host = RemoteHost::new(HOST, "10.0.0.5", "ops");
    host.gpu_count = 8;
    config.hosts.push(host);
    for (id, env) in services {
        let mut spec = ServiceSpec::new(*id, HOST, format!("/models/{}", id));
        spec.environment = env.map(str::to_string);
        config.services.push(spec);
    }
    config.session.job_container = false;
    config.session.escalate = false;
    config.timeouts.health_interval = Duration::from_secs(1);
    config.timeouts.health_ceiling = Duration::from_secs(20);
    config.timeouts.stop_grace = Duration::from_millis(200);
    config
}

pub async fn orchestrator(config: Config, connector: Arc<FakeConnector>) -> Orchestrator {
    Orchestrator::builder()
        .config(config)
        .with_connector(connector)
        .build()
        .await
        .expect("orchestrator builds")
}
