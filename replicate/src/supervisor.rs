use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use tracing::{error, info, warn};

use binlog::filter::TableFilter;
use binlog::gtid::GtidList;
use binlog::handler::RowEventHandler;
use binlog::rpl::{Rpl, SchemaFetcher};
use common::config::ReplicationConfig;
use common::err::{ReplicationError, Result};

use crate::sql::{connect_any, Connector, Server, SqlConnection};
use crate::state::GtidStateFile;

const IDLE_WAIT: Duration = Duration::from_secs(5);

/// Host environment hooks: server discovery and cluster ownership.
pub trait Environment: Send {
    /// Current candidate servers, primaries first.
    fn servers(&mut self) -> Vec<Server>;

    /// Whether this instance holds the cluster lead. Only consulted in
    /// cooperative mode.
    fn is_owner(&mut self) -> bool {
        true
    }
}

struct Control {
    running: AtomicBool,
    should_stop: AtomicBool,
    should_rotate: AtomicBool,

    /// Committed GTID position, readable from outside the worker thread.
    position: Mutex<GtidList>,
    cv: Condvar,
}

impl std::fmt::Debug for Control {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Control").finish_non_exhaustive()
    }
}

impl Control {
    fn new() -> Control {
        Control {
            running: AtomicBool::new(true),
            should_stop: AtomicBool::new(false),
            should_rotate: AtomicBool::new(false),
            position: Mutex::new(GtidList::default()),
            cv: Condvar::new(),
        }
    }

    fn wait(&self) {
        let guard = self.position.lock().unwrap();
        let _unused = self.cv.wait_timeout(guard, IDLE_WAIT).unwrap();
    }
}

type SharedConnection = Arc<Mutex<Option<Box<dyn SqlConnection>>>>;

/// Fetches CREATE TABLE statements over the replication connection.
struct ConnectionFetcher {
    connection: SharedConnection,
}

impl SchemaFetcher for ConnectionFetcher {
    fn fetch_create_table(&mut self, ident: &str) -> Option<String> {
        let mut guard = self.connection.lock().unwrap();
        let conn = guard.as_mut()?;

        match conn.result(&format!("SHOW CREATE TABLE {}", ident)) {
            Ok(rows) => match rows.first() {
                Some(row) if row.len() == 2 => Some(row[1].clone()),
                _ => None,
            },
            Err(e) => {
                error!("Failed to fetch CREATE for '{}': {}", ident, e);
                None
            }
        }
    }
}

/// Owns the replication thread and drives the stream from connect to
/// controlled stop.
pub struct Supervisor {
    control: Arc<Control>,
    thread: Option<JoinHandle<()>>,
}

impl Supervisor {
    /// Start a replication stream. The worker thread connects, replays the
    /// binlog into `handler` and keeps the position durable in the state
    /// file under `cnf.statedir`.
    pub fn start(
        cnf: ReplicationConfig,
        connector: Box<dyn Connector>,
        environment: Box<dyn Environment>,
        handler: Box<dyn RowEventHandler>,
    ) -> Result<Supervisor> {
        let control = Arc::new(Control::new());
        let mut worker = Worker::new(cnf, connector, environment, handler, control.clone())?;

        let thread = std::thread::Builder::new()
            .name("replicator".to_string())
            .spawn(move || worker.run())
            .map_err(|e| ReplicationError::State(e.to_string()))?;

        Ok(Supervisor {
            control,
            thread: Some(thread),
        })
    }

    /// Whether the stream is still processing events.
    pub fn ok(&self) -> bool {
        self.control.running.load(Ordering::Relaxed)
    }

    /// The committed GTID position as a comma-separated list.
    pub fn gtid_pos(&self) -> String {
        self.control.position.lock().unwrap().to_string()
    }

    /// Request a flush at the next safe stop point.
    pub fn rotate(&self) {
        self.control.should_rotate.store(true, Ordering::Relaxed);
    }

    /// Request a controlled stop. The worker exits at the next safe stop
    /// point.
    pub fn stop(&self) {
        self.control.should_stop.store(true, Ordering::Relaxed);
        self.control.cv.notify_one();
    }
}

impl Drop for Supervisor {
    fn drop(&mut self) {
        self.stop();

        if let Some(thread) = self.thread.take() {
            let _unused = thread.join();
        }
    }
}

struct Worker {
    cnf: ReplicationConfig,
    connector: Box<dyn Connector>,
    environment: Box<dyn Environment>,
    rpl: Rpl,
    control: Arc<Control>,

    connection: SharedConnection,
    state_file: GtidStateFile,
    gtid_position: GtidList,
    safe_to_stop: bool,
    file_pos: Option<u32>,
}

impl Worker {
    fn new(
        cnf: ReplicationConfig,
        connector: Box<dyn Connector>,
        environment: Box<dyn Environment>,
        handler: Box<dyn RowEventHandler>,
        control: Arc<Control>,
    ) -> Result<Worker> {
        let filter = compile_filter(&cnf)?;

        // Failing to read the stored position is fatal; guessing a position
        // would replay or skip transactions.
        let (state_file, stored) = GtidStateFile::open(&cnf.statedir)?;

        let gtid_position = if stored.is_empty() {
            match cnf.gtid_start.as_str() {
                "" | "newest" | "oldest" => GtidList::default(),
                list => GtidList::parse(list),
            }
        } else {
            stored
        };

        let connection: SharedConnection = Arc::new(Mutex::new(None));

        let mut rpl = Rpl::new(handler, filter);
        rpl.set_fetcher(Box::new(ConnectionFetcher {
            connection: connection.clone(),
        }));

        Ok(Worker {
            cnf,
            connector,
            environment,
            rpl,
            control,
            connection,
            state_file,
            gtid_position,
            safe_to_stop: false,
            file_pos: None,
        })
    }

    fn run(&mut self) {
        let statedir = self.cnf.statedir.clone();
        self.rpl.load_metadata(&statedir);
        self.update_gtid();
        self.publish_position();

        let mut was_active = true;

        while self.control.running.load(Ordering::Relaxed) {
            let owner = !self.cnf.cooperate || self.environment.is_owner();

            if !owner {
                if was_active {
                    was_active = false;
                    info!("Lost ownership of the replication stream.");
                }

                if self.should_stop() {
                    break;
                }

                *self.connection.lock().unwrap() = None;
                self.control.wait();
                continue;
            }

            if !was_active {
                // Pick up the position a peer may have advanced before
                // reconnecting.
                was_active = true;
                self.update_gtid();
                *self.connection.lock().unwrap() = None;
                info!("Gained ownership of the replication stream.");
            }

            if self.connection.lock().unwrap().is_none() {
                if !self.connect() {
                    if self.should_stop() {
                        break;
                    }

                    self.control.wait();
                    continue;
                }
            }

            self.process_next_event();

            if self.should_stop() && self.safe_to_stop {
                info!("Stopped at GTID '{}'", self.gtid_position);
                break;
            } else if self.safe_to_stop && self.control.should_rotate.swap(false, Ordering::Relaxed)
            {
                self.rpl.flush();
            }
        }

        *self.connection.lock().unwrap() = None;
        self.control.running.store(false, Ordering::Relaxed);
    }

    fn should_stop(&self) -> bool {
        self.control.should_stop.load(Ordering::Relaxed)
    }

    fn publish_position(&self) {
        *self.control.position.lock().unwrap() = self.gtid_position.clone();
    }

    /// A sink-provided position overrides the state file.
    fn update_gtid(&mut self) {
        match self.rpl.load_gtid() {
            Some(gtid) => {
                self.rpl.set_gtid(gtid);
                let mut list = GtidList::default();
                list.update(gtid);
                self.gtid_position = list;
            }
            None => {
                if let Some(first) = self.gtid_position.first() {
                    self.rpl.set_gtid(*first);
                }
            }
        }
    }

    fn connect(&mut self) -> bool {
        let servers = self.environment.servers();

        let conn = match connect_any(self.connector.as_mut(), &servers, self.cnf.timeout) {
            Ok(conn) => conn,
            Err(e) => {
                if !servers.is_empty() {
                    error!("{}", e);
                }
                return false;
            }
        };

        *self.connection.lock().unwrap() = Some(conn);
        self.file_pos = None;

        let rval = self.prepare_replication();

        if !rval {
            *self.connection.lock().unwrap() = None;
        }

        rval
    }

    fn prepare_replication(&mut self) -> bool {
        if self.gtid_position.is_empty() {
            self.query_gtid();
        }

        let gtid_list_str = self.gtid_position.to_string();

        let queries = vec![
            "SET @master_heartbeat_period=1000000000".to_string(),
            "SET @master_binlog_checksum = @@global.binlog_checksum".to_string(),
            "SET @mariadb_slave_capability=4".to_string(),
            format!("SET @slave_connect_state='{}'", gtid_list_str),
            "SET @slave_gtid_strict_mode=1".to_string(),
            "SET @slave_gtid_ignore_duplicates=1".to_string(),
            "SET NAMES latin1".to_string(),
        ];

        let mut guard = self.connection.lock().unwrap();
        let Some(conn) = guard.as_mut() else {
            return false;
        };

        if let Err(e) = conn.query_many(&queries) {
            error!("Failed to prepare connection: {}", e);
            return false;
        }

        if let Err(e) = conn.replicate(self.cnf.server_id) {
            error!("Failed to open replication channel: {}", e);
            return false;
        }

        info!(
            "Started replicating from '{}' at GTID '{}'",
            conn.server().name(),
            gtid_list_str
        );

        true
    }

    /// Resolve a starting position from the upstream when none is stored.
    fn query_gtid(&mut self) {
        let mut guard = self.connection.lock().unwrap();
        let Some(conn) = guard.as_mut() else {
            return;
        };

        match self.cnf.gtid_start.as_str() {
            "newest" => {
                if let Ok(rows) = conn.result("SELECT @@gtid_binlog_pos") {
                    if let Some(value) = rows.first().and_then(|r| r.first()) {
                        self.gtid_position = GtidList::parse(value);
                    }
                }
            }
            "oldest" => {
                let Ok(rows) = conn.result("SHOW BINARY LOGS") else {
                    return;
                };

                let Some(file) = rows.first().and_then(|r| r.first()) else {
                    return;
                };

                let show_events = format!("SHOW BINLOG EVENTS IN '{}' LIMIT 100", file);

                if let Ok(rows) = conn.result(&show_events) {
                    for row in rows {
                        // The GTID list value looks like this: [0-3000-17]
                        if row.len() >= 6 && row[2] == "Gtid_list" {
                            let list = row[5].trim_matches(|c| c == '[' || c == ']');
                            self.gtid_position = GtidList::parse(list);
                            break;
                        }
                    }
                }
            }
            _ => {}
        }
    }

    fn process_next_event(&mut self) {
        let fetched = {
            let mut guard = self.connection.lock().unwrap();
            match guard.as_mut() {
                Some(conn) => conn.fetch_event(),
                None => return,
            }
        };

        match fetched {
            Ok(Some(event)) => {
                if let Some(pos) = self.file_pos {
                    if !event.header.position_is_consistent(pos) {
                        error!(
                            "Inconsistent event position: next_pos {} at file position {}; \
                             closing the connection.",
                            event.header.next_pos, pos
                        );
                        *self.connection.lock().unwrap() = None;
                        return;
                    }
                }

                if event.header.next_pos != 0 {
                    self.file_pos = Some(event.header.next_pos);
                }

                match self.rpl.handle_event(&event.header, &event.payload) {
                    Ok(outcome) => {
                        if outcome.safe_stop {
                            self.safe_to_stop = true;
                        }

                        if outcome.commit {
                            self.commit_position();
                        }
                    }
                    Err(e) => {
                        // A localized decode error drops the event; the
                        // stream is re-established to resynchronize.
                        error!("Failed to process replication event: {}", e);
                        *self.connection.lock().unwrap() = None;
                    }
                }
            }
            Ok(None) => {
                // EOF from the server; reconnect after a while.
                *self.connection.lock().unwrap() = None;
                self.control.wait();
            }
            Err(e) => {
                let current = *self.rpl.gtid();

                match self.gtid_position.get(current.domain) {
                    Some(committed) if current.is_same_transaction(committed) => {
                        // No transaction in progress, safe to stop here.
                        self.safe_to_stop = true;
                    }
                    _ => {
                        if self.should_stop() {
                            warn!(
                                "Lost connection while processing GTID '{}' during a controlled \
                                 shutdown. Attempting to roll back partial transactions.",
                                current
                            );
                            self.control.running.store(false, Ordering::Relaxed);
                        }
                    }
                }

                error!("Failed to read replicated event: {}", e);
                *self.connection.lock().unwrap() = None;
            }
        }
    }

    fn commit_position(&mut self) {
        self.rpl.flush();
        self.gtid_position.update(*self.rpl.gtid());
        self.publish_position();
        self.state_file.save(&self.gtid_position);
    }
}

fn compile_filter(cnf: &ReplicationConfig) -> Result<TableFilter> {
    let compile = |src: &Option<String>| -> Result<Option<regex::Regex>> {
        match src {
            Some(s) => regex::Regex::new(s)
                .map(Some)
                .map_err(|e| ReplicationError::Config(format!("bad pattern '{}': {}", s, e))),
            None => Ok(None),
        }
    };

    Ok(TableFilter::new(
        compile(&cnf.match_pattern)?,
        compile(&cnf.exclude)?,
    ))
}
