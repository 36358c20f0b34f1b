use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use bson::{Bson, Document};
use bytes::Bytes;
use tracing::{info, warn};

use common::config::BridgeConfig;

use crate::cache::{patch_response, CacheKey, ResponseCache, ResponseChecksum};
use crate::command::{lookup, role, Command, Plan, SessionContext, SqlReply, ER_NO_SUCH_TABLE};
use crate::error::{BridgeError, ErrorCode, Result};
use crate::packet::{
    create_msg_response, create_reply_response, GetMore, Query, Request, RequestFramer,
};
use crate::protocol::REPLY_CURSOR_NOT_FOUND;

/// What a session asks its host to do. Responses go to the client,
/// statements to the downstream engine.
#[derive(Debug, PartialEq)]
pub enum SessionOutput {
    Response(Vec<u8>),
    SqlStatements(Vec<String>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Ready,
    Busy,
}

/// How the response of the in-flight command is framed back to the client.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ResponseKind {
    Msg { with_checksum: bool },
    Reply,
}

/// The auto-create retry of a TableCreating command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CreateRetry {
    NotTried,
    AwaitingCreate,
    Done,
}

struct Executing {
    command: Command,
    request_id: i32,
    response_kind: ResponseKind,
    cache_key: Option<CacheKey>,

    /// The full statement batch; only one statement is ever in flight.
    statements: Vec<String>,
    sent: usize,
    retry: CreateRetry,
}

/// One client session: a single-threaded READY/BUSY state machine with at
/// most one outstanding downstream command. Requests that arrive while BUSY
/// queue up and drain in order.
pub struct Session {
    config: BridgeConfig,
    cache: Option<Arc<ResponseCache>>,

    user: String,
    client_host: String,
    roles: HashMap<String, u32>,

    framer: RequestFramer,
    state: State,
    backlog: VecDeque<Bytes>,
    executing: Option<Executing>,

    last_error: Option<Document>,
    next_request_id: i32,
}

impl Session {
    pub fn new(config: BridgeConfig, cache: Option<Arc<ResponseCache>>) -> Session {
        Session {
            config,
            cache,
            user: String::new(),
            client_host: String::new(),
            roles: HashMap::new(),
            framer: RequestFramer::default(),
            state: State::Ready,
            backlog: VecDeque::new(),
            executing: None,
            last_error: None,
            next_request_id: 1,
        }
    }

    pub fn set_client(&mut self, user: impl Into<String>, host: impl Into<String>) {
        self.user = user.into();
        self.client_host = host.into();
    }

    pub fn grant(&mut self, db: impl Into<String>, roles: u32) {
        self.roles.insert(db.into(), roles);
    }

    pub fn is_busy(&self) -> bool {
        self.state == State::Busy
    }

    /// Feed client bytes. A returned error is fatal and the host must close
    /// the transport.
    pub fn handle_client_data(&mut self, data: &[u8]) -> Result<Vec<SessionOutput>> {
        self.framer.feed(data);

        let mut outputs = Vec::new();

        while let Some(frame) = self.framer.next_frame()? {
            if self.state == State::Busy {
                self.backlog.push_back(frame);
            } else {
                self.process_frame(&frame, &mut outputs)?;
            }
        }

        Ok(outputs)
    }

    /// Feed one downstream reply while BUSY.
    pub fn handle_sql_reply(&mut self, reply: SqlReply) -> Result<Vec<SessionOutput>> {
        let mut outputs = Vec::new();

        let Some(mut executing) = self.executing.take() else {
            return Err(BridgeError::Protocol(
                "Downstream reply without a command in flight.".to_string(),
            ));
        };

        if executing.retry == CreateRetry::AwaitingCreate {
            match reply {
                SqlReply::Ok { .. } => {
                    // The table exists now, replay the failed statement.
                    executing.retry = CreateRetry::Done;
                    let replay = executing.statements[executing.sent - 1].clone();
                    outputs.push(SessionOutput::SqlStatements(vec![replay]));
                    self.executing = Some(executing);
                    return Ok(outputs);
                }
                SqlReply::Err { code, sql_state, message } => {
                    let err = BridgeError::Mariadb {
                        code,
                        sql_state,
                        message,
                    };
                    self.fail_command(executing, &err, &mut outputs);
                    self.drain_backlog(&mut outputs)?;
                    return Ok(outputs);
                }
                SqlReply::Resultset { .. } => {
                    let err = BridgeError::hard(
                        "Unexpected resultset response to CREATE TABLE",
                        ErrorCode::InternalError,
                    );
                    self.fail_command(executing, &err, &mut outputs);
                    self.drain_backlog(&mut outputs)?;
                    return Ok(outputs);
                }
            }
        }

        // A missing table can be created on the fly once.
        if executing.retry == CreateRetry::NotTried
            && executing.command.def().table_creating
            && self.config.auto_create_tables
        {
            if let SqlReply::Err { code, .. } = &reply {
                if *code == ER_NO_SUCH_TABLE {
                    match executing.command.table_create_statement(self.config.id_column_length) {
                        Ok(create) => {
                            executing.retry = CreateRetry::AwaitingCreate;
                            outputs.push(SessionOutput::SqlStatements(vec![create]));
                            self.executing = Some(executing);
                            return Ok(outputs);
                        }
                        Err(e) => {
                            self.fail_command(executing, &e, &mut outputs);
                            self.drain_backlog(&mut outputs)?;
                            return Ok(outputs);
                        }
                    }
                }
            }
        }

        match executing.command.translate(reply) {
            Ok(None) => {
                // More replies expected; keep exactly one statement in
                // flight.
                if executing.sent < executing.statements.len() {
                    let next = executing.statements[executing.sent].clone();
                    executing.sent += 1;
                    outputs.push(SessionOutput::SqlStatements(vec![next]));
                }

                self.executing = Some(executing);
            }
            Ok(Some(response_doc)) => {
                let response = self.render_response(&executing, &response_doc);

                if let (Some(cache), Some(key)) =
                    (self.cache.as_ref(), executing.cache_key.take())
                {
                    if let Ok(table) = executing.command.table() {
                        cache.put(key, response.clone(), table);
                    }
                }

                self.invalidate_for(&executing.command);
                outputs.push(SessionOutput::Response(response));
                self.state = State::Ready;
                self.drain_backlog(&mut outputs)?;
            }
            Err(e) => {
                self.fail_command(executing, &e, &mut outputs);
                self.drain_backlog(&mut outputs)?;
            }
        }

        Ok(outputs)
    }

    /// The committed state the host consults before abandoning a session
    /// whose downstream connection was lost while BUSY.
    pub fn in_flight_command(&self) -> Option<&Command> {
        self.executing.as_ref().map(|e| &e.command)
    }

    fn next_request_id(&mut self) -> i32 {
        let id = self.next_request_id;
        self.next_request_id += 1;
        id
    }

    fn invalidate_for(&self, command: &Command) {
        let Some(cache) = self.cache.as_ref() else {
            return;
        };

        if command.is_write() {
            if let Ok(table) = command.table() {
                cache.invalidate(&[table]);
            }
        }
    }

    fn fail_command(&mut self, executing: Executing, error: &BridgeError, outputs: &mut Vec<SessionOutput>) {
        if matches!(
            error,
            BridgeError::Hard { .. } | BridgeError::Mariadb { .. }
        ) {
            self.last_error = Some(error.to_last_error());
        }

        let response = self.render_response(&executing, &error.to_document());
        outputs.push(SessionOutput::Response(response));
        self.state = State::Ready;
    }

    fn render_response(&mut self, executing: &Executing, doc: &Document) -> Vec<u8> {
        let request_id = self.next_request_id();

        match executing.response_kind {
            ResponseKind::Msg { with_checksum } => {
                create_msg_response(request_id, executing.request_id, doc, with_checksum)
            }
            ResponseKind::Reply => {
                create_reply_response(request_id, executing.request_id, 0, 0, &[doc.clone()], false)
            }
        }
    }

    fn drain_backlog(&mut self, outputs: &mut Vec<SessionOutput>) -> Result<()> {
        while self.state == State::Ready {
            let Some(frame) = self.backlog.pop_front() else {
                break;
            };

            self.process_frame(&frame, outputs)?;
        }

        Ok(())
    }

    fn process_frame(&mut self, frame: &[u8], outputs: &mut Vec<SessionOutput>) -> Result<()> {
        let request = Request::parse(frame)?;

        if self.config.log_input {
            info!("Request({})", crate::protocol::opcode_to_string(request.header().opcode));
        }

        match request {
            Request::Msg(msg) => {
                let request_id = msg.header.request_id;
                let response_kind = ResponseKind::Msg {
                    with_checksum: msg.checksum_present(),
                };

                let Some(Bson::String(db)) = msg.document.get("$db").cloned() else {
                    return Err(BridgeError::Protocol(
                        "Closing client connection; document did not contain the expected key \
                         '$db'."
                            .to_string(),
                    ));
                };

                self.dispatch_command(
                    db,
                    msg.document,
                    msg.arguments,
                    request_id,
                    response_kind,
                    outputs,
                );
            }
            Request::Insert(insert) => {
                let (db, collection) = split_namespace(&insert.collection);
                let body = bson::doc! {
                    "insert": collection,
                    "documents": insert.documents.iter().cloned().map(Bson::Document)
                        .collect::<Vec<Bson>>(),
                };

                self.dispatch_command(
                    db,
                    body,
                    HashMap::new(),
                    insert.header.request_id,
                    ResponseKind::Reply,
                    outputs,
                );
            }
            Request::Delete(delete) => {
                let (db, collection) = split_namespace(&delete.collection);
                let body = bson::doc! {
                    "delete": collection,
                    "deletes": [{"q": delete.selector.clone(), "limit": 0}],
                };

                self.dispatch_command(
                    db,
                    body,
                    HashMap::new(),
                    delete.header.request_id,
                    ResponseKind::Reply,
                    outputs,
                );
            }
            Request::Update(update) => {
                let (db, collection) = split_namespace(&update.collection);
                let body = bson::doc! {
                    "update": collection,
                    "updates": [{"q": update.selector.clone(), "u": update.update.clone()}],
                };

                self.dispatch_command(
                    db,
                    body,
                    HashMap::new(),
                    update.header.request_id,
                    ResponseKind::Reply,
                    outputs,
                );
            }
            Request::Query(query) => self.dispatch_query(query, outputs),
            Request::GetMore(get_more) => {
                // Cursors are not retained across responses; the cursor the
                // client asks to continue is gone.
                let response = cursor_not_found_reply(self.next_request_id(), &get_more);
                outputs.push(SessionOutput::Response(response));
            }
            Request::KillCursors(_) => {
                // Fire and forget by protocol.
            }
        }

        Ok(())
    }

    fn dispatch_query(&mut self, query: Query, outputs: &mut Vec<SessionOutput>) {
        let (db, collection) = split_namespace(&query.collection);

        let body = if collection == "$cmd" {
            // Commands spelled in the legacy query form.
            let mut body = query.query.clone();
            body.insert("$db", db.clone());
            body
        } else {
            let mut body = bson::doc! {
                "find": collection,
                "filter": query.query.clone(),
                "skip": query.skip,
            };

            if query.n_return > 0 {
                body.insert("limit", query.n_return);
            }

            if let Some(fields) = &query.fields {
                body.insert("projection", fields.clone());
            }

            body
        };

        self.dispatch_command(
            db,
            body,
            HashMap::new(),
            query.header.request_id,
            ResponseKind::Reply,
            outputs,
        );
    }

    fn dispatch_command(
        &mut self,
        db: String,
        body: Document,
        arguments: HashMap<String, Vec<Document>>,
        request_id: i32,
        response_kind: ResponseKind,
        outputs: &mut Vec<SessionOutput>,
    ) {
        match self.execute_command(db, body, arguments, request_id, response_kind, outputs) {
            Ok(()) => {}
            Err(e) => {
                if matches!(
                    e,
                    BridgeError::Hard { .. } | BridgeError::Mariadb { .. }
                ) {
                    self.last_error = Some(e.to_last_error());
                }

                warn!("Command failed: {}", e);

                let next_id = self.next_request_id();
                let doc = e.to_document();

                let response = match response_kind {
                    ResponseKind::Msg { with_checksum } => {
                        create_msg_response(next_id, request_id, &doc, with_checksum)
                    }
                    ResponseKind::Reply => {
                        create_reply_response(next_id, request_id, 0, 0, &[doc], false)
                    }
                };

                outputs.push(SessionOutput::Response(response));
            }
        }
    }

    fn execute_command(
        &mut self,
        db: String,
        body: Document,
        arguments: HashMap<String, Vec<Document>>,
        request_id: i32,
        response_kind: ResponseKind,
        outputs: &mut Vec<SessionOutput>,
    ) -> Result<()> {
        let name = body.keys().next().cloned().unwrap_or_default();

        let Some(def) = lookup(&name) else {
            return Err(BridgeError::soft(
                format!("no such command: '{}'", name),
                ErrorCode::CommandNotFound,
            ));
        };

        if def.admin_only && db != "admin" {
            return Err(BridgeError::soft(
                format!("{} may only be run against the admin database.", name),
                ErrorCode::Unauthorized,
            ));
        }

        if self.config.authorize {
            self.authorize(&db, def.required_role, &name)?;
        }

        // The cache is consulted before the command even exists. Only
        // OP_MSG responses are cached; patching cannot change the opcode
        // of a stored response.
        let mut cache_key = None;

        if def.is_cacheable && matches!(response_kind, ResponseKind::Msg { .. }) {
            if let Some(cache) = self.cache.as_ref() {
                let key = CacheKey::new(&self.user, &self.client_host, &db, &body);

                if let Some(mut cached) = cache.get(&key) {
                    let mode = match response_kind {
                        ResponseKind::Msg { with_checksum: true } => ResponseChecksum::Update,
                        _ => ResponseChecksum::Reset,
                    };

                    let next_id = self.next_request_id();
                    patch_response(&mut cached, next_id, request_id, mode);
                    outputs.push(SessionOutput::Response(cached));
                    return Ok(());
                }

                cache_key = Some(key);
            }
        }

        let mut command = Command::new(def, db, body, arguments)?;

        if !command.is_get_last_error() {
            self.last_error = None;
        }

        let ctx = SessionContext {
            client_host: &self.client_host,
            last_error: self.last_error.as_ref(),
            id_column_length: self.config.id_column_length,
        };

        match command.prepare(&ctx)? {
            Plan::Immediate(doc) => {
                let next_id = self.next_request_id();

                let response = match response_kind {
                    ResponseKind::Msg { with_checksum } => {
                        create_msg_response(next_id, request_id, &doc, with_checksum)
                    }
                    ResponseKind::Reply => {
                        create_reply_response(next_id, request_id, 0, 0, &[doc], false)
                    }
                };

                outputs.push(SessionOutput::Response(response));
            }
            Plan::Sql(statements) => {
                if self.config.log_output {
                    for sql in &statements {
                        info!("SQL: {}", sql);
                    }
                }

                outputs.push(SessionOutput::SqlStatements(vec![statements[0].clone()]));

                self.executing = Some(Executing {
                    command,
                    request_id,
                    response_kind,
                    cache_key,
                    statements,
                    sent: 1,
                    retry: CreateRetry::NotTried,
                });
                self.state = State::Busy;
            }
        }

        Ok(())
    }

    /// Authorization against the role bitmask of the resolved database.
    /// USER_ADMIN in `admin` is promoted across all databases.
    fn authorize(&self, db: &str, required: u32, name: &str) -> Result<()> {
        if required == role::NONE {
            return Ok(());
        }

        let mut mask = self.roles.get(db).copied().unwrap_or(role::NONE);

        if self.roles.get("admin").copied().unwrap_or(0) & role::USER_ADMIN != 0 {
            mask |= role::USER_ADMIN;
        }

        // Writes imply reads.
        if mask & role::READ_WRITE != 0 {
            mask |= role::READ;
        }

        if mask & required != required {
            return Err(BridgeError::soft(
                format!("not authorized on {} to execute command {}", db, name),
                ErrorCode::Unauthorized,
            ));
        }

        Ok(())
    }
}

fn split_namespace(collection: &str) -> (String, String) {
    match collection.split_once('.') {
        Some((db, coll)) => (db.to_string(), coll.to_string()),
        None => (collection.to_string(), collection.to_string()),
    }
}

fn cursor_not_found_reply(request_id: i32, get_more: &GetMore) -> Vec<u8> {
    let doc = bson::doc! {
        "ok": 0,
        "errmsg": format!("cursor id {} not found", get_more.cursor_id),
        "code": 43,
        "codeName": "CursorNotFound",
    };

    let mut response = create_reply_response(
        request_id,
        get_more.header.request_id,
        0,
        0,
        &[doc],
        false,
    );

    // Flag the missing cursor in the reply header as well.
    let flags = REPLY_CURSOR_NOT_FOUND;
    response[16..20].copy_from_slice(&flags.to_le_bytes());
    response
}
