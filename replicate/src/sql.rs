use binlog::event::RepHeader;
use common::err::Result;

/// A server the replication stream can be started from.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Server {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub password: String,
}

impl Server {
    pub fn name(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// One replicated event: the parsed header and the payload that follows it.
#[derive(Debug, Clone)]
pub struct ReplicationEvent {
    pub header: RepHeader,
    pub payload: Vec<u8>,
}

/// Minimal interface to an upstream connection. The actual client library
/// is a collaborator supplied by the host; the replication logic only needs
/// this much of it.
pub trait SqlConnection: Send + std::fmt::Debug {
    /// Execute a statement, discarding any result.
    fn query(&mut self, sql: &str) -> Result<()>;

    /// Execute several statements in order, failing on the first error.
    fn query_many(&mut self, sql: &[String]) -> Result<()> {
        for s in sql {
            self.query(s)?;
        }
        Ok(())
    }

    /// Execute a query and return the rows as strings.
    fn result(&mut self, sql: &str) -> Result<Vec<Vec<String>>>;

    /// Start replicating with the given server id.
    fn replicate(&mut self, server_id: u32) -> Result<()>;

    /// Fetch the next replication event. `Ok(None)` means the server closed
    /// the stream with an EOF.
    fn fetch_event(&mut self) -> Result<Option<ReplicationEvent>>;

    /// The server this connection was made to.
    fn server(&self) -> &Server;
}

/// Factory for upstream connections.
pub trait Connector: Send {
    fn connect(&mut self, server: &Server, timeout: u64) -> Result<Box<dyn SqlConnection>>;
}

/// Connect to the first reachable server from a candidate list. Returns the
/// last error when every candidate fails.
pub fn connect_any(
    connector: &mut dyn Connector,
    servers: &[Server],
    timeout: u64,
) -> std::result::Result<Box<dyn SqlConnection>, String> {
    let mut last_error = "no server candidates".to_string();

    for server in servers {
        match connector.connect(server, timeout) {
            Ok(conn) => return Ok(conn),
            Err(e) => {
                last_error = format!("{}: {}", server.name(), e);
            }
        }
    }

    Err(last_error)
}


#[cfg(test)]
mod test {
    use super::*;
    use common::err::ReplicationError;

    struct FlakyConnector {
        fail_first: usize,
    }

    impl Connector for FlakyConnector {
        fn connect(&mut self, server: &Server, _timeout: u64) -> Result<Box<dyn SqlConnection>> {
            if self.fail_first > 0 {
                self.fail_first -= 1;
                return Err(ReplicationError::Connection(format!(
                    "refused by {}",
                    server.name()
                )));
            }

            Ok(Box::new(test_support::FakeConnection {
                server: server.clone(),
                queries: Default::default(),
                results: Default::default(),
                events: Default::default(),
            }))
        }
    }

    fn servers() -> Vec<Server> {
        vec![
            Server {
                host: "a".into(),
                port: 3306,
                ..Server::default()
            },
            Server {
                host: "b".into(),
                port: 3306,
                ..Server::default()
            },
        ]
    }

    #[test]
    fn falls_back_across_candidates() {
        let mut connector = FlakyConnector { fail_first: 1 };
        let conn = connect_any(&mut connector, &servers(), 10).unwrap();
        assert_eq!(conn.server().host, "b");
    }

    #[test]
    fn reports_last_error() {
        let mut connector = FlakyConnector { fail_first: 99 };
        let err = connect_any(&mut connector, &servers(), 10).unwrap_err();
        assert!(err.contains("b:3306"));
    }

    #[test]
    fn empty_candidate_list() {
        let mut connector = FlakyConnector { fail_first: 0 };
        assert!(connect_any(&mut connector, &[], 10).is_err());
    }
}
