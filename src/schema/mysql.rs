//! MySQL schema adapter.
//!
//! Dumps each object category as re-ingestable SQL in dependency order and
//! applies dump scripts statement by statement. MySQL has no transactional
//! DDL, so apply is per-statement with an optional best-effort mode.

use crate::config::DatabaseSettings;
use crate::error::Error;
use crate::schema::{
    apply::{split_statements, syntax_error_line},
    topo_sort, values, ApplyReport, EngineInfo, ObjectCategory, SchemaAdapter,
};
use crate::Result;
use async_trait::async_trait;
use futures_util::TryStreamExt;
use sqlx::mysql::{MySqlConnectOptions, MySqlConnection};
use sqlx::{ConnectOptions, Connection, Executor, Row};
use std::collections::BTreeMap;

pub struct MySqlAdapter {
    conn: MySqlConnection,
    db_name: String,
}

impl MySqlAdapter {
    /// Open the single connection this job will use.
    pub async fn connect(db: &DatabaseSettings, password: &str) -> Result<Self> {
        let options = MySqlConnectOptions::new()
            .host(&db.host)
            .port(db.port)
            .username(&db.user)
            .password(password)
            .database(&db.db_name);

        let conn = options
            .connect()
            .await
            .map_err(|e| map_db_error(e, "connect"))?;

        tracing::info!(db = %db.db_name, host = %db.host, "connected to MySQL");
        Ok(Self {
            conn,
            db_name: db.db_name.clone(),
        })
    }

    async fn tables_sorted(&mut self) -> Result<Vec<String>> {
        let tables: Vec<String> = sqlx::query_scalar(
            "SELECT TABLE_NAME FROM information_schema.TABLES \
             WHERE TABLE_SCHEMA = ? AND TABLE_TYPE = 'BASE TABLE' ORDER BY TABLE_NAME",
        )
        .bind(&self.db_name)
        .fetch_all(&mut self.conn)
        .await
        .map_err(|e| map_db_error(e, "list tables"))?;

        if tables.is_empty() {
            return Ok(tables);
        }

        // Foreign-key topology: referenced tables come first.
        let fk_rows = sqlx::query(
            "SELECT TABLE_NAME, REFERENCED_TABLE_NAME \
             FROM information_schema.KEY_COLUMN_USAGE \
             WHERE TABLE_SCHEMA = ? AND REFERENCED_TABLE_NAME IS NOT NULL",
        )
        .bind(&self.db_name)
        .fetch_all(&mut self.conn)
        .await
        .map_err(|e| map_db_error(e, "list foreign keys"))?;

        let mut deps: BTreeMap<String, Vec<String>> = BTreeMap::new();
        for row in fk_rows {
            let child: String = row.try_get(0).map_err(|e| map_db_error(e, "foreign keys"))?;
            let parent: String = row.try_get(1).map_err(|e| map_db_error(e, "foreign keys"))?;
            deps.entry(child).or_default().push(parent);
        }

        Ok(topo_sort(&tables, &deps))
    }

    async fn primary_key_columns(&mut self, table: &str) -> Result<Vec<String>> {
        sqlx::query_scalar(
            "SELECT COLUMN_NAME FROM information_schema.KEY_COLUMN_USAGE \
             WHERE TABLE_SCHEMA = ? AND TABLE_NAME = ? AND CONSTRAINT_NAME = 'PRIMARY' \
             ORDER BY ORDINAL_POSITION",
        )
        .bind(&self.db_name)
        .bind(table)
        .fetch_all(&mut self.conn)
        .await
        .map_err(|e| map_db_error(e, "primary key"))
    }

    async fn show_create(&mut self, kind: &str, name: &str, column: &str) -> Result<String> {
        let sql = format!("SHOW CREATE {} `{}`", kind, name);
        let row = sqlx::query(&sql)
            .fetch_one(&mut self.conn)
            .await
            .map_err(|e| map_db_error(e, &sql))?;
        let stmt: Option<String> = row.try_get(column).map_err(|e| map_db_error(e, &sql))?;
        stmt.ok_or_else(|| {
            Error::PermissionDenied(format!("definition of {} `{}` is not visible", kind, name))
        })
    }

    async fn dump_tables(&mut self) -> Result<Option<String>> {
        let tables = self.tables_sorted().await?;
        let mut statements = Vec::with_capacity(tables.len());
        for table in &tables {
            let stmt = self.show_create("TABLE", table, "Create Table").await?;
            statements.push(format!("-- Create {} table\n{}", table, stmt));
        }
        Ok(join_terminated(&statements, ";\n\n"))
    }

    async fn dump_data(&mut self) -> Result<Option<String>> {
        let tables = self.tables_sorted().await?;
        let mut out = String::new();
        for table in &tables {
            let pk = self.primary_key_columns(table).await?;
            let order_by = if pk.is_empty() {
                String::new()
            } else {
                let cols: Vec<String> = pk.iter().map(|c| format!("`{}`", c)).collect();
                format!(" ORDER BY {}", cols.join(", "))
            };

            let sql = format!("SELECT * FROM `{}`{}", table, order_by);
            let mut tuples: Vec<String> = Vec::new();
            {
                let mut rows = sqlx::query(&sql).fetch(&mut self.conn);
                while let Some(row) = rows
                    .try_next()
                    .await
                    .map_err(|e| map_db_error(e, &sql))?
                {
                    let mut literals = Vec::with_capacity(row.len());
                    for idx in 0..row.len() {
                        literals.push(values::sql_literal(&row, idx)?);
                    }
                    tuples.push(format!("({})", literals.join(", ")));
                }
            }

            if tuples.is_empty() {
                tracing::warn!(table = %table, "no rows, skipping insert statements");
                continue;
            }

            out.push_str(&format!(
                "-- Insert into {} table\nINSERT INTO `{}` VALUES\n\t{};\n",
                table,
                table,
                tuples.join(",\n\t")
            ));
        }
        Ok(if out.is_empty() { None } else { Some(out) })
    }

    async fn dump_views(&mut self) -> Result<Option<String>> {
        let views: Vec<String> = sqlx::query_scalar(
            "SELECT TABLE_NAME FROM information_schema.VIEWS \
             WHERE TABLE_SCHEMA = ? ORDER BY TABLE_NAME",
        )
        .bind(&self.db_name)
        .fetch_all(&mut self.conn)
        .await
        .map_err(|e| map_db_error(e, "list views"))?;

        if views.is_empty() {
            return Ok(None);
        }

        let mut definitions: BTreeMap<String, String> = BTreeMap::new();
        for view in &views {
            let stmt = self.show_create("VIEW", view, "Create View").await?;
            definitions.insert(view.clone(), stmt);
        }

        // A definition mentioning another view's name depends on it.
        let mut deps: BTreeMap<String, Vec<String>> = BTreeMap::new();
        for (view, stmt) in &definitions {
            let lower = stmt.to_lowercase();
            for other in &views {
                if other != view && lower.contains(&other.to_lowercase()) {
                    deps.entry(view.clone()).or_default().push(other.clone());
                }
            }
        }

        let sorted = topo_sort(&views, &deps);
        let statements: Vec<String> = sorted
            .iter()
            .map(|v| format!("-- Create {} view\n{}", v, definitions[v]))
            .collect();
        Ok(join_terminated(&statements, ";\n\n"))
    }

    async fn dump_functions(&mut self) -> Result<Option<String>> {
        let functions: Vec<String> = self.routines("FUNCTION").await?;
        if functions.is_empty() {
            return Ok(None);
        }

        let mut definitions: BTreeMap<String, String> = BTreeMap::new();
        for function in &functions {
            let stmt = self
                .show_create("FUNCTION", function, "Create Function")
                .await?;
            definitions.insert(function.clone(), stmt);
        }

        // A body mentioning another function's name depends on it.
        let mut deps: BTreeMap<String, Vec<String>> = BTreeMap::new();
        for (function, stmt) in &definitions {
            let lower = stmt.to_lowercase();
            for other in &functions {
                if other != function && lower.contains(&other.to_lowercase()) {
                    deps.entry(function.clone()).or_default().push(other.clone());
                }
            }
        }

        let sorted = topo_sort(&functions, &deps);
        let blocks: Vec<String> = sorted
            .iter()
            .map(|f| delimiter_block("function", f, &definitions[f]))
            .collect();
        Ok(join_terminated(&blocks, "\n\n"))
    }

    async fn dump_procedures(&mut self) -> Result<Option<String>> {
        let procedures = self.routines("PROCEDURE").await?;
        let mut blocks = Vec::with_capacity(procedures.len());
        for procedure in &procedures {
            let stmt = self
                .show_create("PROCEDURE", procedure, "Create Procedure")
                .await?;
            blocks.push(delimiter_block("procedure", procedure, &stmt));
        }
        Ok(join_terminated(&blocks, "\n\n"))
    }

    async fn dump_triggers(&mut self) -> Result<Option<String>> {
        let triggers: Vec<String> = sqlx::query_scalar(
            "SELECT TRIGGER_NAME FROM information_schema.TRIGGERS \
             WHERE TRIGGER_SCHEMA = ? ORDER BY TRIGGER_NAME",
        )
        .bind(&self.db_name)
        .fetch_all(&mut self.conn)
        .await
        .map_err(|e| map_db_error(e, "list triggers"))?;

        let mut blocks = Vec::with_capacity(triggers.len());
        for trigger in &triggers {
            let stmt = self
                .show_create("TRIGGER", trigger, "SQL Original Statement")
                .await?;
            blocks.push(delimiter_block("trigger", trigger, &stmt));
        }
        Ok(join_terminated(&blocks, "\n\n"))
    }

    async fn dump_events(&mut self) -> Result<Option<String>> {
        let events = sqlx::query(
            "SELECT EVENT_NAME, STATUS FROM information_schema.EVENTS \
             WHERE EVENT_SCHEMA = ? ORDER BY EVENT_NAME",
        )
        .bind(&self.db_name)
        .fetch_all(&mut self.conn)
        .await
        .map_err(|e| map_db_error(e, "list events"))?;

        if events.is_empty() {
            return Ok(None);
        }

        let mut blocks = Vec::with_capacity(events.len());
        let mut originally_enabled = Vec::new();
        for row in &events {
            let name: String = row.try_get(0).map_err(|e| map_db_error(e, "events"))?;
            let status: String = row.try_get(1).map_err(|e| map_db_error(e, "events"))?;
            let stmt = self.show_create("EVENT", &name, "Create Event").await?;

            // Events are recreated disabled so they cannot fire against a
            // half-restored database; originally enabled ones are switched
            // back on at the end of the dump.
            if status.eq_ignore_ascii_case("ENABLED") {
                originally_enabled.push(name.clone());
            }
            blocks.push(delimiter_block("event", &name, &disable_first(&stmt)));
        }

        if !originally_enabled.is_empty() {
            let mut tail = String::from("-- Re-enable originally enabled events");
            for name in &originally_enabled {
                tail.push_str(&format!("\nALTER EVENT `{}` ENABLE;", name));
            }
            blocks.push(tail);
        }

        Ok(join_terminated(&blocks, "\n\n"))
    }

    async fn routines(&mut self, routine_type: &str) -> Result<Vec<String>> {
        sqlx::query_scalar(
            "SELECT ROUTINE_NAME FROM information_schema.ROUTINES \
             WHERE ROUTINE_SCHEMA = ? AND ROUTINE_TYPE = ? ORDER BY ROUTINE_NAME",
        )
        .bind(&self.db_name)
        .bind(routine_type)
        .fetch_all(&mut self.conn)
        .await
        .map_err(|e| map_db_error(e, "list routines"))
    }

    async fn execute_raw(&mut self, sql: &str) -> Result<()> {
        (&mut self.conn)
            .execute(sql)
            .await
            .map_err(|e| map_statement_error(e, sql))?;
        Ok(())
    }
}

#[async_trait]
impl SchemaAdapter for MySqlAdapter {
    async fn engine(&mut self) -> Result<EngineInfo> {
        let version: String = sqlx::query_scalar("SELECT VERSION()")
            .fetch_one(&mut self.conn)
            .await
            .map_err(|e| map_db_error(e, "server version"))?;
        Ok(EngineInfo {
            kind: "mysql".to_string(),
            version,
        })
    }

    async fn dump_category(&mut self, category: ObjectCategory) -> Result<Option<String>> {
        let dump = match category {
            ObjectCategory::Tables => self.dump_tables().await?,
            ObjectCategory::Data => self.dump_data().await?,
            ObjectCategory::Views => self.dump_views().await?,
            ObjectCategory::Functions => self.dump_functions().await?,
            ObjectCategory::Procedures => self.dump_procedures().await?,
            ObjectCategory::Triggers => self.dump_triggers().await?,
            ObjectCategory::Events => self.dump_events().await?,
        };
        match &dump {
            Some(text) => tracing::info!(category = %category, bytes = text.len(), "category dumped"),
            None => tracing::warn!(category = %category, "no objects, category skipped"),
        }
        Ok(dump)
    }

    async fn drop_all_objects(&mut self) -> Result<()> {
        let events: Vec<String> = sqlx::query_scalar(
            "SELECT EVENT_NAME FROM information_schema.EVENTS WHERE EVENT_SCHEMA = ?",
        )
        .bind(&self.db_name)
        .fetch_all(&mut self.conn)
        .await
        .map_err(|e| map_db_error(e, "list events"))?;
        let triggers: Vec<String> = sqlx::query_scalar(
            "SELECT TRIGGER_NAME FROM information_schema.TRIGGERS WHERE TRIGGER_SCHEMA = ?",
        )
        .bind(&self.db_name)
        .fetch_all(&mut self.conn)
        .await
        .map_err(|e| map_db_error(e, "list triggers"))?;
        let procedures = self.routines("PROCEDURE").await?;
        let functions = self.routines("FUNCTION").await?;
        let views: Vec<String> =
            sqlx::query_scalar("SELECT TABLE_NAME FROM information_schema.VIEWS WHERE TABLE_SCHEMA = ?")
                .bind(&self.db_name)
                .fetch_all(&mut self.conn)
                .await
                .map_err(|e| map_db_error(e, "list views"))?;
        let tables: Vec<String> = sqlx::query_scalar(
            "SELECT TABLE_NAME FROM information_schema.TABLES \
             WHERE TABLE_SCHEMA = ? AND TABLE_TYPE = 'BASE TABLE'",
        )
        .bind(&self.db_name)
        .fetch_all(&mut self.conn)
        .await
        .map_err(|e| map_db_error(e, "list tables"))?;

        // Dependent objects go first; FK checks are suspended only while
        // tables are being torn down.
        self.execute_raw("SET FOREIGN_KEY_CHECKS = 0").await?;
        let result = async {
            for event in &events {
                self.execute_raw(&format!("DROP EVENT IF EXISTS `{}`", event))
                    .await?;
            }
            for trigger in &triggers {
                self.execute_raw(&format!("DROP TRIGGER IF EXISTS `{}`", trigger))
                    .await?;
            }
            for procedure in &procedures {
                self.execute_raw(&format!("DROP PROCEDURE IF EXISTS `{}`", procedure))
                    .await?;
            }
            for function in &functions {
                self.execute_raw(&format!("DROP FUNCTION IF EXISTS `{}`", function))
                    .await?;
            }
            for view in &views {
                self.execute_raw(&format!("DROP VIEW IF EXISTS `{}`", view))
                    .await?;
            }
            for table in &tables {
                self.execute_raw(&format!("DROP TABLE IF EXISTS `{}`", table))
                    .await?;
            }
            Ok(())
        }
        .await;
        self.execute_raw("SET FOREIGN_KEY_CHECKS = 1").await?;
        result
    }

    async fn apply_script(&mut self, script: &str, best_effort: bool) -> Result<ApplyReport> {
        let statements = split_statements(script);
        let mut report = ApplyReport::default();

        for statement in &statements {
            match self.execute_raw(statement).await {
                Ok(()) => report.executed += 1,
                Err(e) if best_effort => {
                    tracing::warn!(error = %e, "statement skipped (best effort)");
                    report.skipped.push(statement.clone());
                }
                Err(e) => return Err(e),
            }
        }

        Ok(report)
    }

    async fn close(self: Box<Self>) -> Result<()> {
        self.conn
            .close()
            .await
            .map_err(|e| map_db_error(e, "close"))?;
        Ok(())
    }
}

fn join_terminated(parts: &[String], sep: &str) -> Option<String> {
    if parts.is_empty() {
        None
    } else {
        Some(format!("{}{}", parts.join(sep), sep))
    }
}

fn delimiter_block(kind: &str, name: &str, stmt: &str) -> String {
    format!(
        "-- Create {} {}\nDELIMITER ;;\n{};;\nDELIMITER ;",
        name, kind, stmt
    )
}

/// Rewrite the first standalone `ENABLE` to `DISABLE`.
fn disable_first(stmt: &str) -> String {
    let bytes = stmt.as_bytes();
    let mut from = 0;
    while let Some(pos) = stmt[from..].find("ENABLE") {
        let start = from + pos;
        let end = start + "ENABLE".len();
        let boundary = |b: u8| !b.is_ascii_alphanumeric() && b != b'_';
        let before_ok = start == 0 || boundary(bytes[start - 1]);
        let after_ok = end == stmt.len() || boundary(bytes[end]);
        if before_ok && after_ok {
            return format!("{}DISABLE{}", &stmt[..start], &stmt[end..]);
        }
        from = end;
    }
    stmt.to_string()
}

/// Classify a connection-scope sqlx error.
fn map_db_error(e: sqlx::Error, what: &str) -> Error {
    match &e {
        sqlx::Error::Database(db) => {
            let number = mysql_errno(db.as_ref());
            match number {
                1044 | 1045 | 1142 | 1227 | 1370 => {
                    Error::PermissionDenied(format!("{}: {}", what, db.message()))
                }
                _ => Error::Internal(anyhow::anyhow!("{}: {}", what, db.message())),
            }
        }
        sqlx::Error::Io(_) | sqlx::Error::Tls(_) | sqlx::Error::Protocol(_) => {
            Error::ConnectFailed(format!("{}: {}", what, e))
        }
        _ => Error::Internal(anyhow::anyhow!("{}: {}", what, e)),
    }
}

/// Classify an error from executing a restore statement, keeping the
/// offending statement verbatim.
fn map_statement_error(e: sqlx::Error, statement: &str) -> Error {
    if let sqlx::Error::Database(db) = &e {
        let message = db.message().to_string();
        return match mysql_errno(db.as_ref()) {
            1064 | 1149 => Error::Syntax {
                line: syntax_error_line(&message),
                column: 0,
                statement: statement.to_string(),
            },
            1044 | 1045 | 1142 | 1227 | 1370 => Error::PermissionDenied(message),
            1048 | 1062 | 1146 | 1216 | 1217 | 1305 | 1356 | 1451 | 1452 | 3819 => {
                Error::ConstraintViolation {
                    object: first_identifier(statement),
                    message,
                }
            }
            _ => Error::Internal(anyhow::anyhow!("{} (statement: {})", message, statement)),
        };
    }
    map_db_error(e, "execute")
}

fn mysql_errno(db: &dyn sqlx::error::DatabaseError) -> u16 {
    db.try_downcast_ref::<sqlx::mysql::MySqlDatabaseError>()
        .map(|m| m.number())
        .unwrap_or(0)
}

/// First backticked identifier in a statement, for error context.
fn first_identifier(statement: &str) -> String {
    let mut parts = statement.split('`');
    parts.next();
    parts
        .next()
        .map(|s| s.to_string())
        .unwrap_or_else(|| "unknown".to_string())
}
