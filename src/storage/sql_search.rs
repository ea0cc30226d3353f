//! Translates [`Search`] criteria into a parameterized `WHERE` clause.
//!
//! Each criteria field becomes one parenthesized OR of comparisons; fields are ANDed.
//! Bind parameters are named after the field and pattern position (`:status_0`,
//! `:time_1_from`, ...). A parameter shared by several type branches is bound once.

use rusqlite::{ToSql, types::Value as SqlValue};

use super::sql::SqlDialect;
use crate::{
    request::{RequestType, StatusKind},
    search::{DatePattern, NumberPattern, Search},
};

/// Matches nothing; used when every pattern of a field is unparseable.
const NO_MATCH: &str = "1 = 0";

#[derive(Debug, Clone)]
pub struct SqlSearch {
    dialect: SqlDialect,
    conditions: Vec<String>,
    bindings: Vec<(String, SqlValue)>,
}

#[derive(Debug, Clone)]
enum BoundComparison {
    Compare(&'static str, String),
    Between(String, String),
}

impl SqlSearch {
    pub fn new(search: &Search, dialect: SqlDialect) -> Self {
        let mut translated = Self {
            dialect,
            conditions: Vec::new(),
            bindings: Vec::new(),
        };
        translated.translate(search);
        translated
    }

    /// Appends a condition ANDed with the criteria, with the parameters it references.
    pub fn add_condition(
        &mut self,
        condition: impl Into<String>,
        bindings: impl IntoIterator<Item = (String, SqlValue)>,
    ) {
        self.conditions.push(condition.into());
        self.bindings.extend(bindings);
    }

    /// ` WHERE ...`, or an empty string when there are no conditions.
    pub fn where_clause(&self) -> String {
        if self.conditions.is_empty() {
            return String::new();
        }
        format!(" WHERE {}", self.conditions.join(" AND "))
    }

    pub fn conditions(&self) -> &[String] {
        &self.conditions
    }

    pub fn bindings(&self) -> &[(String, SqlValue)] {
        &self.bindings
    }

    pub fn params(&self) -> Vec<(&str, &dyn ToSql)> {
        self.bindings
            .iter()
            .map(|(name, value)| (name.as_str(), value as &dyn ToSql))
            .collect()
    }

    fn column(&self, name: &str) -> String {
        self.dialect.quote(name)
    }

    fn translate(&mut self, search: &Search) {
        if !search.types.is_empty() {
            let names = self.bind_exact("type", &search.types);
            let condition = format!("LOWER({}) IN ({})", self.column("type"), names.join(", "));
            self.conditions.push(condition);
        }

        if !search.uri.is_empty() {
            let names = self.bind_like("uri", &search.uri);
            let condition = self.render_like("uri", &names);
            self.push_request_only(condition);
        }

        if !search.controller.is_empty() {
            let names = self.bind_like("controller", &search.controller);
            let condition = self.render_like("controller", &names);
            self.push_request_only(condition);
        }

        if !search.method.is_empty() {
            let names = self.bind_exact("method", &search.method);
            let condition = format!(
                "LOWER({}) IN ({})",
                self.column("method"),
                names.join(", ")
            );
            self.push_request_only(condition);
        }

        if !search.name.is_empty() {
            let names = self.bind_like("name", &search.name);
            let branches = RequestType::ALL
                .into_iter()
                .map(|kind| {
                    let condition = self.render_like(kind.fields().name, &names);
                    self.type_branch(kind, &condition)
                })
                .collect::<Vec<_>>();
            self.conditions.push(format!("({})", branches.join(" OR ")));
        }

        if !search.status.is_empty() {
            let numbers = self.bind_numbers("status", &search.status);
            let exact = self.bind_exact("status_exact", &search.status);
            let branches = RequestType::ALL
                .into_iter()
                .map(|kind| {
                    let fields = kind.fields();
                    let condition = match fields.status_kind {
                        StatusKind::Number => self.render_comparisons(fields.status, &numbers),
                        StatusKind::Exact => format!(
                            "LOWER({}) IN ({})",
                            self.column(fields.status),
                            exact.join(", ")
                        ),
                    };
                    self.type_branch(kind, &condition)
                })
                .collect::<Vec<_>>();
            self.conditions.push(format!("({})", branches.join(" OR ")));
        }

        if !search.time.is_empty() {
            let numbers = self.bind_numbers("time", &search.time);
            let condition = self.render_comparisons("responseDuration", &numbers);
            self.conditions.push(condition);
        }

        if !search.received.is_empty() {
            let dates = self.bind_dates("received", &search.received);
            let condition = self.render_comparisons("time", &dates);
            self.conditions.push(condition);
        }
    }

    fn push_request_only(&mut self, condition: String) {
        let condition = format!(
            "({} <> '{}' OR {condition})",
            self.column("type"),
            RequestType::Request.as_str()
        );
        self.conditions.push(condition);
    }

    fn type_branch(&self, kind: RequestType, condition: &str) -> String {
        format!(
            "({} = '{}' AND {condition})",
            self.column("type"),
            kind.as_str()
        )
    }

    fn bind(&mut self, name: String, value: SqlValue) -> String {
        self.bindings.push((name.clone(), value));
        name
    }

    fn bind_like(&mut self, prefix: &str, patterns: &[String]) -> Vec<String> {
        patterns
            .iter()
            .enumerate()
            .map(|(index, pattern)| {
                let value = SqlValue::Text(format!("%{}%", escape_like(pattern)));
                self.bind(format!(":{prefix}_{index}"), value)
            })
            .collect()
    }

    fn bind_exact(&mut self, prefix: &str, patterns: &[String]) -> Vec<String> {
        patterns
            .iter()
            .enumerate()
            .map(|(index, pattern)| {
                let value = SqlValue::Text(pattern.trim().to_ascii_lowercase());
                self.bind(format!(":{prefix}_{index}"), value)
            })
            .collect()
    }

    fn bind_numbers(&mut self, prefix: &str, patterns: &[String]) -> Vec<BoundComparison> {
        patterns
            .iter()
            .enumerate()
            .filter_map(|(index, pattern)| {
                let name = format!(":{prefix}_{index}");
                let bound = match NumberPattern::parse(pattern)? {
                    NumberPattern::Less(value) => {
                        BoundComparison::Compare("<", self.bind(name, SqlValue::Real(value)))
                    }
                    NumberPattern::Greater(value) => {
                        BoundComparison::Compare(">", self.bind(name, SqlValue::Real(value)))
                    }
                    NumberPattern::Equal(value) => {
                        BoundComparison::Compare("=", self.bind(name, SqlValue::Real(value)))
                    }
                    NumberPattern::Between(from, to) => BoundComparison::Between(
                        self.bind(format!("{name}_from"), SqlValue::Real(from)),
                        self.bind(format!("{name}_to"), SqlValue::Real(to)),
                    ),
                };
                Some(bound)
            })
            .collect()
    }

    fn bind_dates(&mut self, prefix: &str, patterns: &[String]) -> Vec<BoundComparison> {
        patterns
            .iter()
            .enumerate()
            .filter_map(|(index, pattern)| {
                let name = format!(":{prefix}_{index}");
                let (operator, value) = match DatePattern::parse(pattern)? {
                    DatePattern::Before(value) => ("<", value),
                    DatePattern::After(value) => (">", value),
                };
                Some(BoundComparison::Compare(
                    operator,
                    self.bind(name, SqlValue::Real(value)),
                ))
            })
            .collect()
    }

    fn render_like(&self, column: &str, names: &[String]) -> String {
        let column = self.column(column);
        let parts = names
            .iter()
            .map(|name| format!("{column} LIKE {name} ESCAPE '\\'"))
            .collect::<Vec<_>>();
        format!("({})", parts.join(" OR "))
    }

    fn render_comparisons(&self, column: &str, comparisons: &[BoundComparison]) -> String {
        if comparisons.is_empty() {
            return NO_MATCH.to_owned();
        }
        let column = self.column(column);
        let parts = comparisons
            .iter()
            .map(|comparison| match comparison {
                BoundComparison::Compare(operator, name) => format!("{column} {operator} {name}"),
                BoundComparison::Between(from, to) => {
                    format!("({column} > {from} AND {column} < {to})")
                }
            })
            .collect::<Vec<_>>();
        format!("({})", parts.join(" OR "))
    }
}

/// Escapes `LIKE` wildcards so patterns match literally.
pub fn escape_like(pattern: &str) -> String {
    let mut escaped = String::with_capacity(pattern.len());
    for ch in pattern.chars() {
        if matches!(ch, '\\' | '%' | '_') {
            escaped.push('\\');
        }
        escaped.push(ch);
    }
    escaped
}
