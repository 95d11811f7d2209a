//! In-memory stand-ins for the external collaborators.
//!
//! Used by the unit and integration tests and by anyone embedding the crate
//! who wants to exercise lifecycle code without an appliance. Nothing here
//! opens a socket.

use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use crate::appliance::{ProviderBackend, ProviderError, ProviderFlavor};
use crate::errors::{ApplianceError, ChannelError, StoreError};
use crate::net::Reachability;
use crate::remote::{CommandChannel, CommandResult, Connector, InteractiveChannel, SshEndpoint};
use crate::stack::{FailureContext, FailureObserver};
use crate::store::{Query, RelationalStore, Row, StoreOpener};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

/// One scripted answer to a command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply {
    Result(CommandResult),
    /// The channel times out instead of answering.
    Timeout,
}

impl From<CommandResult> for Reply {
    fn from(result: CommandResult) -> Self {
        Reply::Result(result)
    }
}

#[derive(Debug)]
struct Rule {
    pattern: String,
    replies: VecDeque<Reply>,
}

/// Command channel answering from a script.
///
/// Rules match on a substring of the command; the most recently added
/// matching rule answers. A rule with several replies hands them out in
/// order and then repeats its last one. Unmatched commands succeed with no
/// output.
#[derive(Debug, Default)]
pub struct MockChannel {
    host: String,
    rules: Mutex<Vec<Rule>>,
    commands: Mutex<Vec<String>>,
    files: Mutex<HashMap<String, Vec<u8>>>,
    shell_chunks: Mutex<Vec<Vec<u8>>>,
}

impl MockChannel {
    pub fn new(host: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            ..Self::default()
        }
    }

    pub fn respond(&self, pattern: impl Into<String>, result: CommandResult) {
        self.respond_seq(pattern, vec![Reply::Result(result)]);
    }

    pub fn respond_seq(&self, pattern: impl Into<String>, replies: Vec<Reply>) {
        lock(&self.rules).push(Rule {
            pattern: pattern.into(),
            replies: replies.into(),
        });
    }

    /// Commands containing `pattern` time out.
    pub fn time_out(&self, pattern: impl Into<String>) {
        self.respond_seq(pattern, vec![Reply::Timeout]);
    }

    /// Every command run so far, in order.
    pub fn commands(&self) -> Vec<String> {
        lock(&self.commands).clone()
    }

    /// How many commands contained `pattern`.
    pub fn count(&self, pattern: &str) -> usize {
        lock(&self.commands)
            .iter()
            .filter(|c| c.contains(pattern))
            .count()
    }

    pub fn ran(&self, pattern: &str) -> bool {
        self.count(pattern) > 0
    }

    /// Seed a remote file.
    pub fn put_remote(&self, path: impl Into<String>, contents: impl Into<Vec<u8>>) {
        lock(&self.files).insert(path.into(), contents.into());
    }

    pub fn remote_file(&self, path: &str) -> Option<Vec<u8>> {
        lock(&self.files).get(path).cloned()
    }

    /// Output chunks served by the next interactive shell.
    pub fn set_shell_output(&self, chunks: Vec<Vec<u8>>) {
        *lock(&self.shell_chunks) = chunks;
    }

    fn reply_for(&self, command: &str) -> Reply {
        let mut rules = lock(&self.rules);
        let Some(rule) = rules
            .iter_mut()
            .rev()
            .find(|rule| command.contains(&rule.pattern))
        else {
            return Reply::Result(CommandResult::new(0, ""));
        };
        if rule.replies.len() > 1 {
            rule.replies
                .pop_front()
                .unwrap_or(Reply::Result(CommandResult::new(0, "")))
        } else {
            rule.replies
                .front()
                .cloned()
                .unwrap_or(Reply::Result(CommandResult::new(0, "")))
        }
    }
}

#[async_trait]
impl CommandChannel for MockChannel {
    fn host(&self) -> &str {
        &self.host
    }

    async fn run(&self, command: &str, timeout: Option<Duration>) -> Result<CommandResult, ChannelError> {
        lock(&self.commands).push(command.to_string());
        match self.reply_for(command) {
            Reply::Result(result) => Ok(result),
            Reply::Timeout => Err(ChannelError::Timeout {
                host: self.host.clone(),
                command: command.to_string(),
                timeout: timeout.unwrap_or_default(),
            }),
        }
    }

    async fn put_file(&self, local: &Path, remote: &str) -> Result<(), ChannelError> {
        let contents = tokio::fs::read(local).await?;
        lock(&self.files).insert(remote.to_string(), contents);
        Ok(())
    }

    async fn get_file(&self, remote: &str, local: &Path) -> Result<(), ChannelError> {
        let contents = self.remote_file(remote).ok_or_else(|| ChannelError::Transfer {
            from: format!("{}:{remote}", self.host),
            to: local.display().to_string(),
            message: "no such file".to_string(),
        })?;
        tokio::fs::write(local, contents).await?;
        Ok(())
    }

    async fn invoke_shell(&self) -> Result<Box<dyn InteractiveChannel>, ChannelError> {
        let chunks = std::mem::take(&mut *lock(&self.shell_chunks));
        Ok(Box::new(MockShell::new(chunks)))
    }
}

/// Interactive shell that serves canned output chunks and records input.
#[derive(Debug)]
pub struct MockShell {
    chunks: VecDeque<Vec<u8>>,
    sent: Arc<Mutex<Vec<Vec<u8>>>>,
}

impl MockShell {
    pub fn new(chunks: Vec<Vec<u8>>) -> Self {
        Self {
            chunks: chunks.into(),
            sent: Arc::default(),
        }
    }

    /// Handle on everything sent, usable after the shell is boxed away.
    pub fn sent(&self) -> Arc<Mutex<Vec<Vec<u8>>>> {
        self.sent.clone()
    }
}

#[async_trait]
impl InteractiveChannel for MockShell {
    async fn send(&mut self, data: &[u8]) -> Result<(), ChannelError> {
        lock(&self.sent).push(data.to_vec());
        Ok(())
    }

    /// Serves the next chunk; with none left, waits out `timeout` and times out.
    async fn recv(&mut self, buf: &mut [u8], timeout: Duration) -> Result<usize, ChannelError> {
        let Some(mut chunk) = self.chunks.pop_front() else {
            tokio::time::sleep(timeout).await;
            return Err(ChannelError::Timeout {
                host: "mock".to_string(),
                command: "<shell>".to_string(),
                timeout,
            });
        };
        let n = chunk.len().min(buf.len());
        buf[..n].copy_from_slice(&chunk[..n]);
        if n < chunk.len() {
            self.chunks.push_front(chunk.split_off(n));
        }
        Ok(n)
    }
}

/// Hands out one [`MockChannel`] per host, created on first use.
#[derive(Debug, Default)]
pub struct MockConnector {
    channels: Mutex<BTreeMap<String, Arc<MockChannel>>>,
    refused: Mutex<Vec<String>>,
    connects: Mutex<Vec<SshEndpoint>>,
}

impl MockConnector {
    pub fn new() -> Self {
        Self::default()
    }

    /// The channel for `host`, so a test can script it before use.
    pub fn channel(&self, host: &str) -> Arc<MockChannel> {
        lock(&self.channels)
            .entry(host.to_string())
            .or_insert_with(|| Arc::new(MockChannel::new(host)))
            .clone()
    }

    /// Connections to `host` fail.
    pub fn refuse(&self, host: &str) {
        lock(&self.refused).push(host.to_string());
    }

    /// Every endpoint a connection was attempted to.
    pub fn connects(&self) -> Vec<SshEndpoint> {
        lock(&self.connects).clone()
    }
}

#[async_trait]
impl Connector for MockConnector {
    async fn connect(&self, endpoint: &SshEndpoint) -> Result<Arc<dyn CommandChannel>, ChannelError> {
        lock(&self.connects).push(endpoint.clone());
        if lock(&self.refused).contains(&endpoint.hostname) {
            return Err(ChannelError::Connect {
                host: endpoint.hostname.clone(),
                message: "connection refused".to_string(),
            });
        }
        Ok(self.channel(&endpoint.hostname))
    }
}

type Tables = Arc<Mutex<BTreeMap<String, Vec<Row>>>>;

/// Relational store over in-memory tables. Clones share the tables.
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    hostname: String,
    tables: Tables,
}

impl MemoryStore {
    pub fn new(hostname: impl Into<String>) -> Self {
        Self {
            hostname: hostname.into(),
            tables: Tables::default(),
        }
    }

    pub fn create_table(&self, table: &str) {
        lock(&self.tables).entry(table.to_string()).or_default();
    }

    pub fn insert(&self, table: &str, row: Row) {
        lock(&self.tables)
            .entry(table.to_string())
            .or_default()
            .push(row);
    }

    pub fn drop_table(&self, table: &str) {
        lock(&self.tables).remove(table);
    }
}

#[async_trait]
impl RelationalStore for MemoryStore {
    fn hostname(&self) -> &str {
        &self.hostname
    }

    async fn has_table(&self, table: &str) -> Result<bool, StoreError> {
        Ok(lock(&self.tables).contains_key(table))
    }

    async fn fetch(&self, query: &Query) -> Result<Vec<Row>, StoreError> {
        let tables = lock(&self.tables);
        let rows = tables
            .get(&query.table)
            .ok_or_else(|| StoreError::MissingTable(query.table.clone()))?;
        Ok(query.apply(rows))
    }
}

/// Opens [`MemoryStore`] handles over one shared set of tables.
///
/// Each open returns a fresh handle, so a re-opened store is observably a
/// different object.
#[derive(Debug, Default)]
pub struct MemoryStoreOpener {
    store: MemoryStore,
    opened: Mutex<Vec<String>>,
}

impl MemoryStoreOpener {
    pub fn new(store: MemoryStore) -> Self {
        Self {
            store,
            opened: Mutex::default(),
        }
    }

    /// Database addresses opened so far.
    pub fn opened(&self) -> Vec<String> {
        lock(&self.opened).clone()
    }
}

#[async_trait]
impl StoreOpener for MemoryStoreOpener {
    async fn open(
        &self,
        db_address: &str,
        _database: &str,
        _channel: Arc<dyn CommandChannel>,
    ) -> Result<Arc<dyn RelationalStore>, StoreError> {
        lock(&self.opened).push(db_address.to_string());
        Ok(Arc::new(MemoryStore {
            hostname: db_address.to_string(),
            tables: self.store.tables.clone(),
        }))
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MockVm {
    pub ip: Option<String>,
    pub running: bool,
    pub template: bool,
}

/// Provider with an in-memory VM inventory.
#[derive(Debug, Default)]
pub struct MockProvider {
    key: String,
    flavor: ProviderFlavor,
    vms: Mutex<BTreeMap<String, MockVm>>,
    actions: Mutex<Vec<String>>,
}

impl MockProvider {
    pub fn new(key: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            ..Self::default()
        }
    }

    pub fn with_flavor(mut self, flavor: ProviderFlavor) -> Self {
        self.flavor = flavor;
        self
    }

    /// Add a running VM.
    pub fn add_vm(&self, name: &str, ip: Option<&str>) {
        lock(&self.vms).insert(
            name.to_string(),
            MockVm {
                ip: ip.map(str::to_string),
                running: true,
                template: false,
            },
        );
    }

    /// Hand the VM a new lease.
    pub fn set_ip(&self, name: &str, ip: Option<&str>) {
        if let Some(vm) = lock(&self.vms).get_mut(name) {
            vm.ip = ip.map(str::to_string);
        }
    }

    pub fn vm(&self, name: &str) -> Option<MockVm> {
        lock(&self.vms).get(name).cloned()
    }

    /// `"<action> <vm>"` for every power or inventory change, in order.
    pub fn actions(&self) -> Vec<String> {
        lock(&self.actions).clone()
    }

    fn update(
        &self,
        action: &str,
        vm_name: &str,
        change: impl FnOnce(&mut MockVm),
    ) -> Result<(), ProviderError> {
        let mut vms = lock(&self.vms);
        let vm = vms.get_mut(vm_name).ok_or_else(|| self.not_found(vm_name))?;
        change(vm);
        lock(&self.actions).push(format!("{action} {vm_name}"));
        Ok(())
    }

    fn not_found(&self, vm_name: &str) -> ProviderError {
        ProviderError::VmNotFound {
            provider: self.key.clone(),
            vm_name: vm_name.to_string(),
        }
    }
}

#[async_trait]
impl ProviderBackend for MockProvider {
    fn key(&self) -> &str {
        &self.key
    }

    async fn vm_ip(&self, vm_name: &str) -> Result<Option<String>, ProviderError> {
        let vms = lock(&self.vms);
        let vm = vms.get(vm_name).ok_or_else(|| self.not_found(vm_name))?;
        Ok(vm.ip.clone().filter(|_| vm.running))
    }

    async fn does_vm_exist(&self, vm_name: &str) -> Result<bool, ProviderError> {
        Ok(lock(&self.vms).contains_key(vm_name))
    }

    async fn is_vm_running(&self, vm_name: &str) -> Result<bool, ProviderError> {
        Ok(self.vm(vm_name).is_some_and(|vm| vm.running))
    }

    async fn is_vm_stopped(&self, vm_name: &str) -> Result<bool, ProviderError> {
        Ok(self.vm(vm_name).is_some_and(|vm| !vm.running))
    }

    async fn start_vm(&self, vm_name: &str) -> Result<(), ProviderError> {
        self.update("start", vm_name, |vm| vm.running = true)
    }

    async fn stop_vm(&self, vm_name: &str) -> Result<(), ProviderError> {
        self.update("stop", vm_name, |vm| vm.running = false)
    }

    async fn delete_vm(&self, vm_name: &str) -> Result<(), ProviderError> {
        self.update("delete", vm_name, |_| {})?;
        lock(&self.vms).remove(vm_name);
        Ok(())
    }

    async fn mark_as_template(&self, vm_name: &str) -> Result<(), ProviderError> {
        self.update("templatize", vm_name, |vm| vm.template = true)
    }

    fn flavor(&self) -> ProviderFlavor {
        self.flavor
    }

    async fn set_direct_lun(&self, vm_name: &str, attached: bool) -> Result<(), ProviderError> {
        if self.flavor != ProviderFlavor::Rhev {
            return Err(ProviderError::Unsupported {
                provider: self.key.clone(),
                action: "attach a direct LUN".to_string(),
            });
        }
        let action = if attached { "attach-lun" } else { "detach-lun" };
        self.update(action, vm_name, |_| {})
    }
}

/// Reachability answers from a script.
///
/// Ports are open unless closed. HTTP statuses are served from a queue,
/// falling back to the default status (200) once it runs dry. An `Err`
/// entry is the reason the request got no response.
#[derive(Debug)]
pub struct ScriptedProbe {
    closed_ports: Mutex<Vec<u16>>,
    statuses: Mutex<VecDeque<Result<u16, String>>>,
    default_status: Mutex<Result<u16, String>>,
    http_probes: Mutex<usize>,
}

impl Default for ScriptedProbe {
    fn default() -> Self {
        Self {
            closed_ports: Mutex::default(),
            statuses: Mutex::default(),
            default_status: Mutex::new(Ok(200)),
            http_probes: Mutex::default(),
        }
    }
}

impl ScriptedProbe {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn close_port(&self, port: u16) {
        lock(&self.closed_ports).push(port);
    }

    pub fn open_port(&self, port: u16) {
        lock(&self.closed_ports).retain(|p| *p != port);
    }

    pub fn push_statuses(&self, statuses: impl IntoIterator<Item = Result<u16, String>>) {
        lock(&self.statuses).extend(statuses);
    }

    pub fn set_default_status(&self, status: Result<u16, String>) {
        *lock(&self.default_status) = status;
    }

    pub fn http_probes(&self) -> usize {
        *lock(&self.http_probes)
    }
}

#[async_trait]
impl Reachability for ScriptedProbe {
    async fn port_open(&self, _host: &str, port: u16, _timeout: Duration) -> bool {
        !lock(&self.closed_ports).contains(&port)
    }

    async fn http_status(&self, url: &str, _timeout: Duration) -> Result<u16, ChannelError> {
        *lock(&self.http_probes) += 1;
        let next = lock(&self.statuses).pop_front();
        next.unwrap_or_else(|| lock(&self.default_status).clone())
            .map_err(|message| ChannelError::Http {
                url: url.to_string(),
                message,
            })
    }
}

/// Failure observer that remembers `(appliance, error)` pairs.
#[derive(Debug, Default)]
pub struct RecordingObserver {
    failures: Mutex<Vec<(String, String)>>,
    fail_with: Mutex<Option<String>>,
}

impl RecordingObserver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the observer itself fail after recording.
    pub fn failing(message: impl Into<String>) -> Self {
        Self {
            fail_with: Mutex::new(Some(message.into())),
            ..Self::default()
        }
    }

    pub fn failures(&self) -> Vec<(String, String)> {
        lock(&self.failures).clone()
    }
}

impl FailureObserver for RecordingObserver {
    fn on_failure(&self, context: &FailureContext<'_>) -> Result<(), ApplianceError> {
        lock(&self.failures).push((context.appliance.to_string(), context.error.clone()));
        match lock(&self.fail_with).clone() {
            Some(message) => Err(ApplianceError::Unsupported(message)),
            None => Ok(()),
        }
    }
}
