use std::collections::HashMap;

use bson::{doc, Bson, Document};

use crate::error::{BridgeError, ErrorCode, Result};
use crate::predicate::where_clause_from_query;
use crate::protocol::{MAX_BSON_OBJECT_SIZE, MAX_MSG_SIZE, MAX_WRITE_BATCH_SIZE};
use crate::translate::{
    columns_from_extractions, extractions_from_projection, order_by_value_from_sort,
    table_create_statement,
};
use crate::update::set_value_from_update;
use crate::value::{bson_to_json_text, escape_essential_chars};

/// The relational engine's "table does not exist" error.
pub const ER_NO_SUCH_TABLE: i32 = 1146;

/// Role bits used for authorization.
pub mod role {
    pub const READ: u32 = 0x01;
    pub const READ_WRITE: u32 = 0x02;
    pub const USER_ADMIN: u32 = 0x04;
    pub const DB_ADMIN: u32 = 0x08;

    pub const NONE: u32 = 0;
}

/// A reply from the downstream relational engine, reduced to what the
/// translators need.
#[derive(Debug, Clone)]
pub enum SqlReply {
    Ok {
        affected_rows: u64,
    },
    Err {
        code: i32,
        sql_state: String,
        message: String,
    },
    Resultset {
        rows: Vec<Vec<Option<String>>>,
    },
}

/// How a command is executed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandlerType {
    /// Produces a response from in-memory state alone.
    Immediate,

    /// One statement, one reply.
    Single,

    /// A batch of statements; replies are consumed in the order sent.
    Multi,
}

#[derive(Debug, Clone, Copy)]
pub struct CommandDef {
    pub name: &'static str,
    pub handler: HandlerType,
    pub required_role: u32,
    pub admin_only: bool,
    pub is_cacheable: bool,

    /// Retry once behind a CREATE TABLE when the table does not exist.
    pub table_creating: bool,
}

const fn immediate(name: &'static str) -> CommandDef {
    CommandDef {
        name,
        handler: HandlerType::Immediate,
        required_role: role::NONE,
        admin_only: false,
        is_cacheable: false,
        table_creating: false,
    }
}

const COMMANDS: &[CommandDef] = &[
    immediate("ismaster"),
    immediate("hello"),
    immediate("buildinfo"),
    immediate("ping"),
    immediate("whatsmyuri"),
    immediate("getlasterror"),
    immediate("reseterror"),
    immediate("endsessions"),
    CommandDef {
        name: "find",
        handler: HandlerType::Single,
        required_role: role::READ,
        admin_only: false,
        is_cacheable: true,
        table_creating: false,
    },
    CommandDef {
        name: "count",
        handler: HandlerType::Single,
        required_role: role::READ,
        admin_only: false,
        is_cacheable: true,
        table_creating: false,
    },
    CommandDef {
        name: "insert",
        handler: HandlerType::Multi,
        required_role: role::READ_WRITE,
        admin_only: false,
        is_cacheable: false,
        table_creating: true,
    },
    CommandDef {
        name: "update",
        handler: HandlerType::Single,
        required_role: role::READ_WRITE,
        admin_only: false,
        is_cacheable: false,
        table_creating: true,
    },
    CommandDef {
        name: "delete",
        handler: HandlerType::Single,
        required_role: role::READ_WRITE,
        admin_only: false,
        is_cacheable: false,
        table_creating: false,
    },
    CommandDef {
        name: "create",
        handler: HandlerType::Single,
        required_role: role::DB_ADMIN,
        admin_only: false,
        is_cacheable: false,
        table_creating: false,
    },
    CommandDef {
        name: "drop",
        handler: HandlerType::Single,
        required_role: role::DB_ADMIN,
        admin_only: false,
        is_cacheable: false,
        table_creating: false,
    },
];

pub fn lookup(name: &str) -> Option<&'static CommandDef> {
    let lowered = name.to_ascii_lowercase();
    COMMANDS.iter().find(|c| c.name == lowered)
}

pub fn is_valid_database_name(name: &str) -> bool {
    !name.is_empty() && !name.contains(|c: char| c == '.' || c == ' ' || c == '/' || c == '\\')
}

/// Context a command needs from its session when preparing.
pub struct SessionContext<'a> {
    pub client_host: &'a str,
    pub last_error: Option<&'a Document>,
    pub id_column_length: i64,
}

/// What `prepare` produced.
#[derive(Debug)]
pub enum Plan {
    /// The response, with no downstream round trip.
    Immediate(Document),

    /// Statements to send downstream, in order.
    Sql(Vec<String>),
}

#[derive(Debug)]
enum TranslateState {
    None,

    Find {
        extractions: Vec<String>,
    },

    Count,

    Insert {
        outstanding: usize,
        n: i64,
        write_errors: Vec<Document>,
    },

    Update,
    Delete,

    /// Any statement whose success maps to `{ok: 1}`.
    SimpleOk,
}

/// One client command: the routing envelope plus the per-operation
/// translation state.
#[derive(Debug)]
pub struct Command {
    def: &'static CommandDef,
    pub db: String,
    pub body: Document,
    pub arguments: HashMap<String, Vec<Document>>,
    state: TranslateState,
}

impl Command {
    pub fn new(
        def: &'static CommandDef,
        db: String,
        body: Document,
        arguments: HashMap<String, Vec<Document>>,
    ) -> Result<Command> {
        if !is_valid_database_name(&db) {
            return Err(BridgeError::soft(
                format!("Invalid database name: '{}'", db),
                ErrorCode::InvalidNamespace,
            ));
        }

        Ok(Command {
            def,
            db,
            body,
            arguments,
            state: TranslateState::None,
        })
    }

    pub fn def(&self) -> &'static CommandDef {
        self.def
    }

    pub fn is_cacheable(&self) -> bool {
        self.def.is_cacheable
    }

    pub fn is_write(&self) -> bool {
        self.def.required_role == role::READ_WRITE || self.def.name == "drop"
    }

    pub fn is_get_last_error(&self) -> bool {
        self.def.name == "getlasterror"
    }

    /// The collection name from the command's own body field.
    fn collection(&self) -> Result<String> {
        match self.body.get(self.body.keys().next().map(String::as_str).unwrap_or("")) {
            Some(Bson::String(collection)) if !collection.is_empty() => Ok(collection.clone()),
            _ => Err(BridgeError::soft(
                format!("Invalid namespace specified '{}.'", self.db),
                ErrorCode::InvalidNamespace,
            )),
        }
    }

    /// The fully qualified backing table.
    pub fn table(&self) -> Result<String> {
        Ok(format!("{}.{}", self.db, self.collection()?))
    }

    /// The statement that creates the backing table for a retry.
    pub fn table_create_statement(&self, id_length: i64) -> Result<String> {
        Ok(table_create_statement(&self.table()?, id_length, true))
    }

    pub fn prepare(&mut self, ctx: &SessionContext) -> Result<Plan> {
        match self.def.name {
            "ismaster" | "hello" => Ok(Plan::Immediate(doc! {
                "ismaster": true,
                "maxBsonObjectSize": MAX_BSON_OBJECT_SIZE as i32,
                "maxMessageSizeBytes": MAX_MSG_SIZE as i32,
                "maxWriteBatchSize": MAX_WRITE_BATCH_SIZE as i32,
                "readOnly": false,
                "ok": 1,
            })),
            "buildinfo" => Ok(Plan::Immediate(doc! {
                "version": "4.4.0",
                "versionArray": [4, 4, 0, 0],
                "maxBsonObjectSize": MAX_BSON_OBJECT_SIZE as i32,
                "modules": [],
                "ok": 1,
            })),
            "ping" | "endsessions" => Ok(Plan::Immediate(doc! {"ok": 1})),
            "whatsmyuri" => Ok(Plan::Immediate(doc! {
                "you": ctx.client_host,
                "ok": 1,
            })),
            "getlasterror" => {
                let last = ctx
                    .last_error
                    .cloned()
                    .unwrap_or_else(|| doc! {"ok": 1, "err": Bson::Null, "n": 0});
                Ok(Plan::Immediate(last))
            }
            "reseterror" => Ok(Plan::Immediate(doc! {"ok": 1})),
            "find" => self.prepare_find(),
            "count" => self.prepare_count(),
            "insert" => self.prepare_insert(),
            "update" => self.prepare_update(),
            "delete" => self.prepare_delete(),
            "create" => {
                self.state = TranslateState::SimpleOk;
                Ok(Plan::Sql(vec![
                    self.table_create_statement(ctx.id_column_length)?
                ]))
            }
            "drop" => {
                self.state = TranslateState::SimpleOk;
                Ok(Plan::Sql(vec![format!("DROP TABLE {}", self.table()?)]))
            }
            other => Err(BridgeError::soft(
                format!("no such command: '{}'", other),
                ErrorCode::CommandNotFound,
            )),
        }
    }

    fn prepare_find(&mut self) -> Result<Plan> {
        let table = self.table()?;

        let filter = match self.body.get("filter") {
            Some(Bson::Document(d)) => d.clone(),
            _ => Document::new(),
        };

        let projection = match self.body.get("projection") {
            Some(Bson::Document(d)) => d.clone(),
            _ => Document::new(),
        };

        let extractions = extractions_from_projection(&projection);
        let columns = columns_from_extractions(&extractions);

        let mut sql = format!(
            "SELECT {} FROM {} {}",
            columns,
            table,
            where_clause_from_query(&filter)?
        );

        if let Some(Bson::Document(sort)) = self.body.get("sort") {
            if !sort.is_empty() {
                sql.push_str(&format!(" ORDER BY {}", order_by_value_from_sort(sort)?));
            }
        }

        let skip = self
            .body
            .get("skip")
            .and_then(crate::value::get_number_as_integer)
            .unwrap_or(0);
        let limit = self
            .body
            .get("limit")
            .and_then(crate::value::get_number_as_integer)
            .unwrap_or(0);

        if limit > 0 || skip > 0 {
            let limit = if limit > 0 { limit } else { i64::MAX };
            sql.push_str(&format!(" LIMIT {}, {}", skip, limit));
        }

        self.state = TranslateState::Find { extractions };
        Ok(Plan::Sql(vec![sql]))
    }

    fn prepare_count(&mut self) -> Result<Plan> {
        let table = self.table()?;

        let filter = match self.body.get("query") {
            Some(Bson::Document(d)) => d.clone(),
            _ => Document::new(),
        };

        let sql = format!(
            "SELECT COUNT(id) FROM {} {}",
            table,
            where_clause_from_query(&filter)?
        );

        self.state = TranslateState::Count;
        Ok(Plan::Sql(vec![sql]))
    }

    fn prepare_insert(&mut self) -> Result<Plan> {
        let table = self.table()?;

        let mut documents: Vec<Document> = Vec::new();

        if let Some(Bson::Array(docs)) = self.body.get("documents") {
            for d in docs {
                match d {
                    Bson::Document(d) => documents.push(d.clone()),
                    _ => {
                        return Err(BridgeError::soft(
                            "The documents of an insert must be objects",
                            ErrorCode::TypeMismatch,
                        ));
                    }
                }
            }
        }

        if let Some(docs) = self.arguments.get("documents") {
            documents.extend(docs.iter().cloned());
        }

        if documents.is_empty() {
            return Err(BridgeError::soft(
                "Insert must contain at least one document",
                ErrorCode::BadValue,
            ));
        }

        if documents.len() > MAX_WRITE_BATCH_SIZE {
            return Err(BridgeError::soft(
                format!(
                    "Write batch sizes must be between 1 and {}. Got {} operations.",
                    MAX_WRITE_BATCH_SIZE,
                    documents.len()
                ),
                ErrorCode::FailedToParse,
            ));
        }

        let mut statements = Vec::new();

        for mut d in documents {
            if !d.contains_key("_id") {
                // A missing _id is generated here, as the engine cannot.
                let mut with_id = doc! {"_id": bson::oid::ObjectId::new()};
                with_id.extend(d);
                d = with_id;
            }

            let json = escape_essential_chars(&bson_to_json_text(&Bson::Document(d)));
            statements.push(format!("INSERT INTO {} (doc) VALUES ('{}')", table, json));
        }

        self.state = TranslateState::Insert {
            outstanding: statements.len(),
            n: 0,
            write_errors: Vec::new(),
        };

        Ok(Plan::Sql(statements))
    }

    fn prepare_update(&mut self) -> Result<Plan> {
        let table = self.table()?;

        let updates = match self.body.get("updates") {
            Some(Bson::Array(updates)) if updates.len() == 1 => updates,
            Some(Bson::Array(_)) => {
                return Err(BridgeError::soft(
                    "Currently only one update specification is supported",
                    ErrorCode::CommandFailed,
                ));
            }
            _ => {
                return Err(BridgeError::soft(
                    "The update command requires an 'updates' array",
                    ErrorCode::FailedToParse,
                ));
            }
        };

        let Bson::Document(update) = &updates[0] else {
            return Err(BridgeError::soft(
                "The elements of 'updates' must be objects",
                ErrorCode::TypeMismatch,
            ));
        };

        let filter = match update.get("q") {
            Some(Bson::Document(d)) => d.clone(),
            _ => Document::new(),
        };

        let spec = update.get("u").ok_or_else(|| {
            BridgeError::soft(
                "The update specification must contain a 'u' field",
                ErrorCode::FailedToParse,
            )
        })?;

        let sql = format!(
            "UPDATE {} SET doc = {} {}",
            table,
            set_value_from_update(spec)?,
            where_clause_from_query(&filter)?
        );

        self.state = TranslateState::Update;
        Ok(Plan::Sql(vec![sql]))
    }

    fn prepare_delete(&mut self) -> Result<Plan> {
        let table = self.table()?;

        let deletes = match self.body.get("deletes") {
            Some(Bson::Array(deletes)) if deletes.len() == 1 => deletes,
            Some(Bson::Array(_)) => {
                return Err(BridgeError::soft(
                    "Currently only one delete specification is supported",
                    ErrorCode::CommandFailed,
                ));
            }
            _ => {
                return Err(BridgeError::soft(
                    "The delete command requires a 'deletes' array",
                    ErrorCode::FailedToParse,
                ));
            }
        };

        let Bson::Document(delete) = &deletes[0] else {
            return Err(BridgeError::soft(
                "The elements of 'deletes' must be objects",
                ErrorCode::TypeMismatch,
            ));
        };

        let filter = match delete.get("q") {
            Some(Bson::Document(d)) => d.clone(),
            _ => Document::new(),
        };

        let limit = delete.get("limit").and_then(crate::value::get_number_as_integer);

        let mut sql = format!(
            "DELETE FROM {} {}",
            table,
            where_clause_from_query(&filter)?
        );

        if limit == Some(1) {
            sql.push_str(" LIMIT 1");
        }

        self.state = TranslateState::Delete;
        Ok(Plan::Sql(vec![sql]))
    }

    /// Consume one downstream reply. `None` means more replies are needed
    /// before a response can be produced.
    pub fn translate(&mut self, reply: SqlReply) -> Result<Option<Document>> {
        let state = std::mem::replace(&mut self.state, TranslateState::None);

        match state {
            TranslateState::None => Err(BridgeError::hard(
                "Unexpected reply for an immediate command",
                ErrorCode::InternalError,
            )),

            TranslateState::Find { extractions } => match reply {
                SqlReply::Resultset { rows } => {
                    let documents = resultset_to_documents(&rows, &extractions);
                    let ns = self.table().unwrap_or_default();

                    Ok(Some(doc! {
                        "cursor": {
                            "firstBatch": documents,
                            "id": 0i64,
                            "ns": ns,
                        },
                        "ok": 1,
                    }))
                }
                SqlReply::Err { code, .. } if code == ER_NO_SUCH_TABLE => {
                    // A missing table is an empty collection.
                    let ns = self.table().unwrap_or_default();
                    Ok(Some(doc! {
                        "cursor": {"firstBatch": [], "id": 0i64, "ns": ns},
                        "ok": 1,
                    }))
                }
                SqlReply::Err {
                    code,
                    sql_state,
                    message,
                } => Err(BridgeError::Mariadb {
                    code,
                    sql_state,
                    message,
                }),
                SqlReply::Ok { .. } => Err(BridgeError::hard(
                    "Unexpected OK response to a SELECT",
                    ErrorCode::InternalError,
                )),
            },

            TranslateState::Count => match reply {
                SqlReply::Resultset { rows } => {
                    let n = rows
                        .first()
                        .and_then(|r| r.first())
                        .and_then(|v| v.as_deref())
                        .and_then(|v| v.parse::<i64>().ok())
                        .unwrap_or(0);

                    Ok(Some(doc! {"n": n, "ok": 1}))
                }
                SqlReply::Err { code, .. } if code == ER_NO_SUCH_TABLE => {
                    Ok(Some(doc! {"n": 0, "ok": 1}))
                }
                SqlReply::Err {
                    code,
                    sql_state,
                    message,
                } => Err(BridgeError::Mariadb {
                    code,
                    sql_state,
                    message,
                }),
                SqlReply::Ok { .. } => Err(BridgeError::hard(
                    "Unexpected OK response to a SELECT",
                    ErrorCode::InternalError,
                )),
            },

            TranslateState::Insert {
                mut outstanding,
                mut n,
                mut write_errors,
            } => {
                let index = n + write_errors.len() as i64;

                match reply {
                    SqlReply::Ok { .. } => n += 1,
                    SqlReply::Err { code, message, .. } => {
                        if code == ER_NO_SUCH_TABLE {
                            return Err(BridgeError::Mariadb {
                                code,
                                sql_state: "42S02".to_string(),
                                message,
                            });
                        }

                        write_errors.push(doc! {
                            "index": index as i32,
                            "code": code,
                            "errmsg": message,
                        });
                    }
                    SqlReply::Resultset { .. } => {
                        return Err(BridgeError::hard(
                            "Unexpected resultset response to an INSERT",
                            ErrorCode::InternalError,
                        ));
                    }
                }

                outstanding -= 1;

                if outstanding > 0 {
                    self.state = TranslateState::Insert {
                        outstanding,
                        n,
                        write_errors,
                    };
                    return Ok(None);
                }

                let mut response = doc! {"n": n, "ok": 1};

                if !write_errors.is_empty() {
                    response.insert("writeErrors", write_errors);
                }

                Ok(Some(response))
            }

            TranslateState::Update => match reply {
                SqlReply::Ok { affected_rows } => Ok(Some(doc! {
                    "n": affected_rows as i64,
                    "nModified": affected_rows as i64,
                    "ok": 1,
                })),
                SqlReply::Err {
                    code,
                    sql_state,
                    message,
                } => Err(BridgeError::Mariadb {
                    code,
                    sql_state,
                    message,
                }),
                SqlReply::Resultset { .. } => Err(BridgeError::hard(
                    "Unexpected resultset response to an UPDATE",
                    ErrorCode::InternalError,
                )),
            },

            TranslateState::Delete => match reply {
                SqlReply::Ok { affected_rows } => {
                    Ok(Some(doc! {"n": affected_rows as i64, "ok": 1}))
                }
                SqlReply::Err { code, .. } if code == ER_NO_SUCH_TABLE => {
                    Ok(Some(doc! {"n": 0, "ok": 1}))
                }
                SqlReply::Err {
                    code,
                    sql_state,
                    message,
                } => Err(BridgeError::Mariadb {
                    code,
                    sql_state,
                    message,
                }),
                SqlReply::Resultset { .. } => Err(BridgeError::hard(
                    "Unexpected resultset response to a DELETE",
                    ErrorCode::InternalError,
                )),
            },

            TranslateState::SimpleOk => match reply {
                SqlReply::Ok { .. } => Ok(Some(doc! {"ok": 1})),
                SqlReply::Err {
                    code,
                    sql_state,
                    message,
                } => Err(BridgeError::Mariadb {
                    code,
                    sql_state,
                    message,
                }),
                SqlReply::Resultset { .. } => Ok(Some(doc! {"ok": 1})),
            },
        }
    }

    /// Details included with internal errors.
    pub fn diagnose(&self) -> Document {
        doc! {
            "command": self.def.name,
            "db": self.db.clone(),
        }
    }
}

/// Rebuild response documents from resultset rows. Without extractions a
/// row is the whole `doc` column; with extractions each value lands at its
/// dotted path.
fn resultset_to_documents(rows: &[Vec<Option<String>>], extractions: &[String]) -> Vec<Document> {
    let mut documents = Vec::new();

    for row in rows {
        if extractions.is_empty() {
            if let Some(Some(json)) = row.first() {
                if let Some(d) = json_to_document(json) {
                    documents.push(d);
                }
            }
            continue;
        }

        let mut root = serde_json::Map::new();

        for (value, extraction) in row.iter().zip(extractions.iter()) {
            let Some(value) = value else {
                continue;
            };

            let Ok(parsed) = serde_json::from_str::<serde_json::Value>(value) else {
                continue;
            };

            create_entry(&mut root, extraction, parsed);
        }

        if let Ok(Bson::Document(d)) = Bson::try_from(serde_json::Value::Object(root)) {
            documents.push(d);
        }
    }

    documents
}

fn create_entry(
    root: &mut serde_json::Map<String, serde_json::Value>,
    extraction: &str,
    value: serde_json::Value,
) {
    match extraction.split_once('.') {
        None => {
            root.insert(extraction.to_string(), value);
        }
        Some((head, tail)) => {
            let child = root
                .entry(head.to_string())
                .or_insert_with(|| serde_json::Value::Object(serde_json::Map::new()));

            if let serde_json::Value::Object(map) = child {
                create_entry(map, tail, value);
            }
        }
    }
}

fn json_to_document(json: &str) -> Option<Document> {
    let value: serde_json::Value = serde_json::from_str(json).ok()?;

    match Bson::try_from(value) {
        Ok(Bson::Document(d)) => Some(d),
        _ => None,
    }
}
