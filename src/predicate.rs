//! Filter Predicate Builder
//!
//! Builds the boolean filter expressions that restrict feature lookups and
//! usage reports. A predicate is an ordered chain of nodes: field tests,
//! AND/OR combiners, and parenthesized sub-expressions. Rendering walks the
//! chain left to right and produces a SQL `WHERE` fragment.
//!
//! Values are never spliced into the fragment. Every bindable value renders
//! as a `?` placeholder and is returned alongside the fragment for the store
//! to bind, so quoting problems in scanned feature names (or hostile input)
//! cannot change the query shape.
//!
//! ```rust
//! use flexlm_usage::predicate::{Combiner, Field, Operator, Predicate};
//!
//! let mut pred = Predicate::with_test(Field::Vendor, Operator::Eq, "MLM");
//! pred.add_test(Combiner::And, Field::InUse, Operator::Gt, 0);
//! let (sql, params) = pred.to_sql();
//! assert_eq!(sql, "f.vendor = ? AND c.in_use > ?");
//! assert_eq!(params.len(), 2);
//! ```

use rusqlite::types::{ToSql, ToSqlOutput};

/// Queryable fields spanning the `features` (`f.`) and `counts` (`c.`)
/// tables.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Field {
    FeatureId,
    Feature,
    Vendor,
    Version,
    InUse,
    Issued,
    Expiration,
    Checked,
}

impl Field {
    /// Qualified column name as it appears in the report join.
    pub fn column(self) -> &'static str {
        match self {
            Field::FeatureId => "f.feature_id",
            Field::Feature => "f.feature_string",
            Field::Vendor => "f.vendor",
            Field::Version => "f.version",
            Field::InUse => "c.in_use",
            Field::Issued => "c.issued",
            Field::Expiration => "c.expiration_timestamp",
            Field::Checked => "c.checked_timestamp",
        }
    }
}

/// Comparison operators; the two `IS` forms are unary and take no value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operator {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    Like,
    NotLike,
    Glob,
    Regexp,
    IsNull,
    IsNotNull,
}

impl Operator {
    fn sql(self) -> &'static str {
        match self {
            Operator::Eq => " = ",
            Operator::Ne => " <> ",
            Operator::Lt => " < ",
            Operator::Le => " <= ",
            Operator::Gt => " > ",
            Operator::Ge => " >= ",
            Operator::Like => " LIKE ",
            Operator::NotLike => " NOT LIKE ",
            Operator::Glob => " GLOB ",
            Operator::Regexp => " REGEXP ",
            Operator::IsNull => " IS NULL",
            Operator::IsNotNull => " IS NOT NULL",
        }
    }

    pub fn is_unary(self) -> bool {
        matches!(self, Operator::IsNull | Operator::IsNotNull)
    }
}

/// Joins two adjacent tests or sub-expressions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Combiner {
    And,
    Or,
}

impl Combiner {
    fn sql(self) -> &'static str {
        match self {
            Combiner::And => " AND ",
            Combiner::Or => " OR ",
        }
    }
}

/// A value bound into the query at execution time.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Int(i64),
    Text(String),
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Int(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::Text(v.to_string())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::Text(v)
    }
}

impl ToSql for Value {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        match self {
            Value::Int(i) => i.to_sql(),
            Value::Text(s) => s.to_sql(),
        }
    }
}

#[derive(Debug, Clone)]
enum Node {
    Test {
        field: Field,
        op: Operator,
        value: Value,
    },
    Combiner(Combiner),
    Expression(Predicate),
}

/// A composable boolean filter over feature and count fields.
///
/// Chains are well formed by construction: they begin with a test or
/// sub-expression and every appended node arrives with its combiner, so
/// rendering never has to reject a malformed chain.
#[derive(Debug, Clone)]
pub struct Predicate {
    nodes: Vec<Node>,
}

impl Predicate {
    /// Predicate consisting of a single field test. The value is ignored for
    /// the unary operators.
    pub fn with_test(field: Field, op: Operator, value: impl Into<Value>) -> Self {
        Self {
            nodes: vec![Node::Test {
                field,
                op,
                value: value.into(),
            }],
        }
    }

    /// Append `combiner (field op value)` to the end of the chain.
    pub fn add_test(&mut self, combiner: Combiner, field: Field, op: Operator, value: impl Into<Value>) {
        self.nodes.push(Node::Combiner(combiner));
        self.nodes.push(Node::Test {
            field,
            op,
            value: value.into(),
        });
    }

    /// Append `combiner ( other )`, taking ownership of the nested predicate.
    pub fn add_expression(&mut self, combiner: Combiner, other: Predicate) {
        self.nodes.push(Node::Combiner(combiner));
        self.nodes.push(Node::Expression(other));
    }

    /// Render to a `WHERE` fragment plus the values to bind, in placeholder
    /// order.
    pub fn to_sql(&self) -> (String, Vec<Value>) {
        let mut sql = String::new();
        let mut params = Vec::new();
        self.render(&mut sql, &mut params);
        (sql, params)
    }

    fn render(&self, sql: &mut String, params: &mut Vec<Value>) {
        for node in &self.nodes {
            match node {
                Node::Test { field, op, value } => {
                    sql.push_str(field.column());
                    sql.push_str(op.sql());
                    if !op.is_unary() {
                        sql.push('?');
                        params.push(value.clone());
                    }
                }
                Node::Combiner(combiner) => sql.push_str(combiner.sql()),
                Node::Expression(nested) => {
                    sql.push_str("( ");
                    nested.render(sql, params);
                    sql.push_str(" )");
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_single_test_renders_placeholder() {
        let pred = Predicate::with_test(Field::Vendor, Operator::Eq, "MLM");
        let (sql, params) = pred.to_sql();
        assert_eq!(sql, "f.vendor = ?");
        assert_eq!(params, vec![Value::Text("MLM".to_string())]);
    }

    #[test]
    fn test_chained_tests_scenario() {
        let mut pred = Predicate::with_test(Field::FeatureId, Operator::Eq, "3");
        pred.add_test(Combiner::And, Field::InUse, Operator::Gt, 0);
        let (sql, params) = pred.to_sql();
        assert_eq!(sql, "f.feature_id = ? AND c.in_use > ?");
        assert_eq!(
            params,
            vec![Value::Text("3".to_string()), Value::Int(0)]
        );
    }

    #[test]
    fn test_combiner_count_matches_node_count() {
        let mut pred = Predicate::with_test(Field::Feature, Operator::Like, "MAT%");
        pred.add_test(Combiner::Or, Field::Vendor, Operator::Eq, "MLM");
        pred.add_test(Combiner::And, Field::Issued, Operator::Ge, 10);

        let mut nested = Predicate::with_test(Field::Version, Operator::Ne, "beta");
        nested.add_test(Combiner::Or, Field::Version, Operator::IsNull, "");
        pred.add_expression(Combiner::And, nested);

        let (sql, _) = pred.to_sql();
        // Top chain has four non-combiner nodes (three tests, one nested
        // expression) and the nested chain has two, so three plus one
        // combiner tokens should appear.
        assert_eq!(sql.matches(" AND ").count(), 2);
        assert_eq!(sql.matches(" OR ").count(), 2);
    }

    #[test]
    fn test_unary_operator_binds_nothing() {
        let pred = Predicate::with_test(Field::Expiration, Operator::IsNull, "ignored");
        let (sql, params) = pred.to_sql();
        assert_eq!(sql, "c.expiration_timestamp IS NULL");
        assert!(params.is_empty());
    }

    #[test]
    fn test_nested_expression_is_parenthesized() {
        let mut inner = Predicate::with_test(Field::Vendor, Operator::Eq, "MLM");
        inner.add_test(Combiner::Or, Field::Vendor, Operator::Eq, "SNPSLMD");
        let mut pred = Predicate::with_test(Field::InUse, Operator::Gt, 0);
        pred.add_expression(Combiner::And, inner);

        let (sql, params) = pred.to_sql();
        assert_eq!(sql, "c.in_use > ? AND ( f.vendor = ? OR f.vendor = ? )");
        assert_eq!(params.len(), 3);
    }

    #[test]
    fn test_hostile_value_stays_out_of_fragment() {
        let pred = Predicate::with_test(Field::Feature, Operator::Eq, "x' OR '1'='1");
        let (sql, params) = pred.to_sql();
        assert_eq!(sql, "f.feature_string = ?");
        assert_eq!(params, vec![Value::Text("x' OR '1'='1".to_string())]);
    }

    #[test]
    fn test_regexp_and_glob_operators() {
        let mut pred = Predicate::with_test(Field::Feature, Operator::Regexp, "^MATLAB.*");
        pred.add_test(Combiner::Or, Field::Feature, Operator::Glob, "Sim*");
        let (sql, _) = pred.to_sql();
        assert_eq!(sql, "f.feature_string REGEXP ? OR f.feature_string GLOB ?");
    }
}
