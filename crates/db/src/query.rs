//! Ordered select-query builder used by the search path.

use sea_orm::{Statement, Value};

use crate::dialect::Dialect;

pub struct SelectQuery {
    dialect: Dialect,
    fields: Vec<String>,
    from: String,
    conditions: Vec<String>,
    args: Vec<Value>,
    order_by: Option<String>,
    limit: i64,
    one_extra: bool,
}

impl SelectQuery {
    pub fn new(dialect: Dialect, from: &str) -> Self {
        Self {
            dialect,
            fields: Vec::new(),
            from: from.to_string(),
            conditions: Vec::new(),
            args: Vec::new(),
            order_by: None,
            limit: 0,
            one_extra: false,
        }
    }

    pub fn fields(&mut self, fields: &[&str]) -> &mut Self {
        self.fields
            .extend(fields.iter().map(|f| self.dialect.quote(f)));
        self
    }

    pub fn add_where(&mut self, column: &str, value: impl Into<Value>) -> &mut Self {
        self.conditions
            .push(format!("{}=?", self.dialect.quote(column)));
        self.args.push(value.into());
        self
    }

    pub fn add_where_gt(&mut self, column: &str, value: impl Into<Value>) -> &mut Self {
        self.conditions
            .push(format!("{}>?", self.dialect.quote(column)));
        self.args.push(value.into());
        self
    }

    /// `column IN (…)` with one placeholder per value, in order.
    pub fn add_where_in(&mut self, column: &str, values: Vec<Value>) -> &mut Self {
        let marks: Vec<&str> = values.iter().map(|_| "?").collect();
        self.conditions.push(format!(
            "{} IN ({})",
            self.dialect.quote(column),
            marks.join(",")
        ));
        self.args.extend(values);
        self
    }

    /// `column IN (<subquery>)`; the subquery is written with `?`
    /// placeholders and its args follow any already collected.
    pub fn add_where_in_subquery(
        &mut self,
        column: &str,
        subquery: &str,
        args: Vec<Value>,
    ) -> &mut Self {
        self.conditions.push(format!(
            "{} IN ({})",
            self.dialect.quote(column),
            subquery
        ));
        self.args.extend(args);
        self
    }

    pub fn order_by_asc(&mut self, column: &str) -> &mut Self {
        self.order_by = Some(format!("{} ASC", self.dialect.quote(column)));
        self
    }

    /// Request one extra row past the limit so the caller can detect a
    /// further page.
    pub fn limit(&mut self, limit: i64, one_extra: bool) -> &mut Self {
        self.limit = limit;
        self.one_extra = one_extra;
        self
    }

    pub fn to_statement(&self) -> Statement {
        let mut sql = format!("SELECT {} FROM {}", self.fields.join(","), self.from);
        if !self.conditions.is_empty() {
            sql.push_str(" WHERE ");
            sql.push_str(
                &self
                    .conditions
                    .iter()
                    .map(|c| format!("({})", c))
                    .collect::<Vec<_>>()
                    .join(" AND "),
            );
        }
        if let Some(order) = &self.order_by {
            sql.push_str(" ORDER BY ");
            sql.push_str(order);
        }
        if self.limit > 0 {
            let limit = self.limit + if self.one_extra { 1 } else { 0 };
            sql.push_str(&format!(" LIMIT {}", limit));
        }
        self.dialect.statement(sql, self.args.clone())
    }
}
