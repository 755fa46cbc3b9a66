//! SQL dialect adapter: parameterised statement construction portable
//! across the supported relational backends.

use sea_orm::{DbBackend, Statement, Value};

#[derive(Debug, Clone, Copy)]
pub struct Dialect {
    backend: DbBackend,
}

impl Dialect {
    pub fn new(backend: DbBackend) -> Self {
        Self { backend }
    }

    pub fn backend(&self) -> DbBackend {
        self.backend
    }

    pub fn quote(&self, ident: &str) -> String {
        match self.backend {
            DbBackend::MySql => format!("`{}`", ident),
            _ => format!("\"{}\"", ident),
        }
    }

    /// Build a parameterised INSERT. Column order is preserved exactly
    /// as given; values are never interpolated into the SQL text.
    pub fn insert_query(&self, table: &str, columns: &[(&str, Value)]) -> Statement {
        let names: Vec<String> = columns.iter().map(|(c, _)| self.quote(c)).collect();
        let marks: Vec<&str> = columns.iter().map(|_| "?").collect();
        let sql = format!(
            "INSERT INTO {} ({}) VALUES ({})",
            self.quote(table),
            names.join(","),
            marks.join(",")
        );
        self.statement(sql, columns.iter().map(|(_, v)| v.clone()).collect())
    }

    /// Build a parameterised UPDATE; set columns first, then the
    /// where columns, in the given order.
    pub fn update_query(
        &self,
        table: &str,
        set: &[(&str, Value)],
        where_: &[(&str, Value)],
    ) -> Statement {
        let sets: Vec<String> = set
            .iter()
            .map(|(c, _)| format!("{}=?", self.quote(c)))
            .collect();
        let conds: Vec<String> = where_
            .iter()
            .map(|(c, _)| format!("{}=?", self.quote(c)))
            .collect();
        let sql = format!(
            "UPDATE {} SET {} WHERE {}",
            self.quote(table),
            sets.join(","),
            conds.join(" AND ")
        );
        let values = set.iter().chain(where_.iter()).map(|(_, v)| v.clone()).collect();
        self.statement(sql, values)
    }

    /// Row-lock suffix for the version read at the head of a write
    /// transaction. SQLite serialises writers itself and accepts no
    /// FOR UPDATE syntax.
    pub fn for_update_clause(&self) -> &'static str {
        match self.backend {
            DbBackend::Sqlite => "",
            _ => " FOR UPDATE",
        }
    }

    /// Column type for opaque binary payloads.
    pub fn blob_type(&self) -> &'static str {
        match self.backend {
            DbBackend::MySql => "LONGBLOB",
            DbBackend::Postgres => "BYTEA",
            _ => "BLOB",
        }
    }

    /// Wrap SQL written with `?` placeholders into a statement for this
    /// backend, renumbering to `$N` for Postgres.
    pub fn statement(&self, sql: String, values: Vec<Value>) -> Statement {
        Statement::from_sql_and_values(self.backend, self.finalize(&sql), values)
    }

    fn finalize(&self, sql: &str) -> String {
        if self.backend != DbBackend::Postgres {
            return sql.to_string();
        }
        let mut out = String::with_capacity(sql.len() + 8);
        let mut n = 0usize;
        for c in sql.chars() {
            if c == '?' {
                n += 1;
                out.push('$');
                out.push_str(&n.to_string());
            } else {
                out.push(c);
            }
        }
        out
    }
}
