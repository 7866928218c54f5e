//! Parameterized SQL assembly for the primary database.
//!
//! Fragments are written with `?` markers. A [`Predicate`] is an immutable
//! list of such fragments plus their arguments, appended in order. The
//! [`SelectBuilder`] renders one predicate twice, once for the data
//! statement and once for the count statement, and only then renumbers
//! markers to PostgreSQL `$n` placeholders. Since both statements are built
//! from the same value, their filters cannot drift apart.
//!
//! The row limit is a clamped [`Limit`] and is bound like every other value.

use chrono::{DateTime, Utc};

use crate::filters::{Limit, TimeWindow};
use crate::geo::{BoundingBox, GeoPoint};

/// SRID of every geometry column.
pub const SRID: i32 = 4326;

/// A bound argument.
#[derive(Debug, Clone, PartialEq)]
pub enum SqlArg {
    Int(i64),
    Float(f64),
    Text(String),
    Time(DateTime<Utc>),
    TextList(Vec<String>),
}

/// An ordered conjunction of SQL fragments and their arguments.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Predicate {
    clauses: Vec<String>,
    args: Vec<SqlArg>,
}

impl Predicate {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append one fragment. Its `?` markers must match `args` one to one.
    pub fn and(mut self, fragment: impl Into<String>, args: Vec<SqlArg>) -> Self {
        let fragment = fragment.into();
        debug_assert_eq!(
            count_markers(&fragment),
            args.len(),
            "marker/argument mismatch in {:?}",
            fragment
        );
        self.clauses.push(fragment);
        self.args.extend(args);
        self
    }

    /// Equality on a text column.
    pub fn eq_text(self, column: &str, value: &str) -> Self {
        self.and(format!("{} = ?", column), vec![SqlArg::Text(value.to_string())])
    }

    /// Membership in a text list. An empty list adds nothing.
    pub fn any_text(self, column: &str, values: &[String]) -> Self {
        if values.is_empty() {
            return self;
        }
        self.and(
            format!("{} = ANY(?)", column),
            vec![SqlArg::TextList(values.to_vec())],
        )
    }

    /// Case-insensitive substring match.
    pub fn ilike(self, column: &str, term: &str) -> Self {
        self.and(
            format!("{} ILIKE ? ESCAPE '\\'", column),
            vec![SqlArg::Text(like_pattern(term))],
        )
    }

    /// Half-open `[start, end)` window. Open sides add nothing.
    pub fn time_window(self, column: &str, window: &TimeWindow) -> Self {
        let mut p = self;
        if let Some(start) = window.start {
            p = p.and(format!("{} >= ?", column), vec![SqlArg::Time(start)]);
        }
        if let Some(end) = window.end {
            p = p.and(format!("{} < ?", column), vec![SqlArg::Time(end)]);
        }
        p
    }

    /// Radius search: coarse envelope on the raw geometry plus exact
    /// great-circle distance on the sphere, matching [`crate::geo::haversine_m`].
    pub fn within_radius(self, column: &str, center: GeoPoint, radius_m: f64) -> Self {
        let envelope = BoundingBox::around(center, radius_m);
        self.and(
            format!("{} && {}", column, make_envelope()),
            envelope_args(&envelope),
        )
        .and(
            format!(
                "ST_DWithin({}::geography, {}::geography, ?, false)",
                column,
                make_point()
            ),
            vec![
                SqlArg::Float(center.longitude),
                SqlArg::Float(center.latitude),
                SqlArg::Float(radius_m),
            ],
        )
    }

    /// Box search: coarse envelope plus boundary-inclusive `ST_Covers`.
    pub fn within_box(self, column: &str, bbox: &BoundingBox) -> Self {
        self.and(
            format!("{} && {}", column, make_envelope()),
            envelope_args(bbox),
        )
        .and(
            format!("ST_Covers({}, {})", make_envelope(), column),
            envelope_args(bbox),
        )
    }

    pub fn is_empty(&self) -> bool {
        self.clauses.is_empty()
    }

    pub fn args(&self) -> &[SqlArg] {
        &self.args
    }

    /// ` WHERE a AND b`, or an empty string.
    fn where_clause(&self) -> String {
        if self.clauses.is_empty() {
            String::new()
        } else {
            format!(" WHERE {}", self.clauses.join(" AND "))
        }
    }
}

/// `ST_MakeEnvelope(?, ?, ?, ?, 4326)`; args are `min_lon, min_lat, max_lon, max_lat`.
pub fn make_envelope() -> String {
    format!("ST_MakeEnvelope(?, ?, ?, ?, {})", SRID)
}

/// `ST_SetSRID(ST_MakePoint(?, ?), 4326)`; args are `lon, lat`.
pub fn make_point() -> String {
    format!("ST_SetSRID(ST_MakePoint(?, ?), {})", SRID)
}

fn envelope_args(b: &BoundingBox) -> Vec<SqlArg> {
    vec![
        SqlArg::Float(b.min_lon),
        SqlArg::Float(b.min_lat),
        SqlArg::Float(b.max_lon),
        SqlArg::Float(b.max_lat),
    ]
}

/// `%term%` with LIKE metacharacters escaped.
pub fn like_pattern(term: &str) -> String {
    let mut out = String::with_capacity(term.len() + 2);
    out.push('%');
    for c in term.chars() {
        if matches!(c, '%' | '_' | '\\') {
            out.push('\\');
        }
        out.push(c);
    }
    out.push('%');
    out
}

/// Count `?` markers outside single-quoted literals.
fn count_markers(sql: &str) -> usize {
    let mut in_literal = false;
    sql.chars()
        .filter(|c| {
            if *c == '\'' {
                in_literal = !in_literal;
            }
            *c == '?' && !in_literal
        })
        .count()
}

/// Replace `?` markers with `$1..$n`, skipping single-quoted literals.
fn renumber(sql: &str) -> String {
    let mut out = String::with_capacity(sql.len() + 16);
    let mut in_literal = false;
    let mut n = 0;
    for c in sql.chars() {
        match c {
            '\'' => {
                in_literal = !in_literal;
                out.push(c);
            }
            '?' if !in_literal => {
                n += 1;
                out.push('$');
                out.push_str(&n.to_string());
            }
            _ => out.push(c),
        }
    }
    out
}

/// A rendered statement ready to bind.
#[derive(Debug, Clone, PartialEq)]
pub struct Statement {
    pub sql: String,
    pub args: Vec<SqlArg>,
}

impl Statement {
    /// Render `?` markers to `$n`.
    pub fn new(sql_with_markers: &str, args: Vec<SqlArg>) -> Self {
        debug_assert_eq!(count_markers(sql_with_markers), args.len());
        Self {
            sql: renumber(sql_with_markers),
            args,
        }
    }

    /// Number of distinct `$n` placeholders in the rendered SQL.
    pub fn placeholder_count(&self) -> usize {
        let bytes = self.sql.as_bytes();
        let mut max = 0usize;
        let mut i = 0;
        while i < bytes.len() {
            if bytes[i] == b'$' {
                let start = i + 1;
                let mut end = start;
                while end < bytes.len() && bytes[end].is_ascii_digit() {
                    end += 1;
                }
                if end > start {
                    if let Ok(n) = self.sql[start..end].parse::<usize>() {
                        max = max.max(n);
                    }
                }
                i = end.max(i + 1);
            } else {
                i += 1;
            }
        }
        max
    }
}

/// Data statement plus its matching count statement.
#[derive(Debug, Clone, PartialEq)]
pub struct QueryPair {
    pub select: Statement,
    pub count: Statement,
}

/// Builder for `SELECT ... FROM ... WHERE ... ORDER BY ... LIMIT ?`.
#[derive(Debug, Clone)]
pub struct SelectBuilder {
    columns: String,
    column_args: Vec<SqlArg>,
    from: String,
    count_expr: String,
    predicate: Predicate,
    order_by: Option<String>,
}

impl SelectBuilder {
    pub fn new(columns: impl Into<String>, from: impl Into<String>) -> Self {
        Self {
            columns: columns.into(),
            column_args: Vec::new(),
            from: from.into(),
            count_expr: "COUNT(*)".to_string(),
            predicate: Predicate::new(),
            order_by: None,
        }
    }

    /// Arguments consumed by `?` markers in the select list. They precede
    /// the predicate arguments in the data statement only.
    pub fn column_args(mut self, args: Vec<SqlArg>) -> Self {
        self.column_args = args;
        self
    }

    pub fn count_expr(mut self, expr: impl Into<String>) -> Self {
        self.count_expr = expr.into();
        self
    }

    pub fn filter(mut self, predicate: Predicate) -> Self {
        self.predicate = predicate;
        self
    }

    pub fn order_by(mut self, order: impl Into<String>) -> Self {
        self.order_by = Some(order.into());
        self
    }

    pub fn build(self, limit: Limit) -> QueryPair {
        let where_clause = self.predicate.where_clause();

        let mut select_sql = format!("SELECT {} FROM {}{}", self.columns, self.from, where_clause);
        if let Some(order) = &self.order_by {
            select_sql.push_str(" ORDER BY ");
            select_sql.push_str(order);
        }
        select_sql.push_str(" LIMIT ?");

        let mut select_args = self.column_args;
        select_args.extend(self.predicate.args.iter().cloned());
        select_args.push(SqlArg::Int(limit.get()));

        let count_sql = format!("SELECT {} FROM {}{}", self.count_expr, self.from, where_clause);

        QueryPair {
            select: Statement::new(&select_sql, select_args),
            count: Statement::new(&count_sql, self.predicate.args),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::filters::LimitBounds;
    use chrono::TimeZone;

    const BOUNDS: LimitBounds = LimitBounds::new(1, 200, 25);

    fn window() -> TimeWindow {
        TimeWindow::new(
            Some(Utc.with_ymd_and_hms(2020, 1, 1, 0, 0, 0).unwrap()),
            Some(Utc.with_ymd_and_hms(2021, 1, 1, 0, 0, 0).unwrap()),
        )
        .unwrap()
    }

    fn distance_column() -> String {
        format!(
            "ST_Distance(m.location::geography, {}::geography) AS distance_m",
            make_point()
        )
    }

    /// Every subset of the optional filters a measurement query can carry.
    fn all_predicates() -> Vec<(String, Predicate)> {
        let center = GeoPoint::new(35.0, 139.0).unwrap();
        let bbox = BoundingBox::new(35.0, 36.0, 139.0, 140.0).unwrap();
        let mut out = Vec::new();
        for mask in 0u8..32 {
            let mut p = Predicate::new();
            if mask & 1 != 0 {
                p = p.within_radius("m.location", center, 1500.0);
            }
            if mask & 2 != 0 {
                p = p.within_box("m.location", &bbox);
            }
            if mask & 4 != 0 {
                p = p.time_window("m.captured_at", &window());
            }
            if mask & 8 != 0 {
                p = p.ilike("m.detector", "LND_7317%");
            }
            if mask & 16 != 0 {
                p = p.any_text("m.device_id", &["a".to_string(), "b".to_string()]);
            }
            out.push((format!("mask {:05b}", mask), p));
        }
        out
    }

    #[test]
    fn test_placeholders_match_args_for_every_combination() {
        for (label, p) in all_predicates() {
            let pair = SelectBuilder::new("m.id", "measurements m")
                .filter(p)
                .order_by("m.captured_at DESC")
                .build(Limit::clamped(Some(10), BOUNDS));
            assert_eq!(pair.select.placeholder_count(), pair.select.args.len(), "{}", label);
            assert_eq!(pair.count.placeholder_count(), pair.count.args.len(), "{}", label);
        }
    }

    #[test]
    fn test_count_and_select_share_predicate() {
        for (label, p) in all_predicates() {
            let pair = SelectBuilder::new(distance_column(), "measurements m")
                .column_args(vec![SqlArg::Float(139.0), SqlArg::Float(35.0)])
                .filter(p)
                .order_by("distance_m")
                .build(Limit::clamped(None, BOUNDS));
            assert_eq!(pair.select.placeholder_count(), pair.select.args.len(), "{}", label);

            // Select args = column args + predicate args + limit.
            let pred_args = &pair.select.args[2..pair.select.args.len() - 1];
            assert_eq!(pred_args, pair.count.args.as_slice(), "{}", label);

            // Same WHERE text modulo placeholder numbering.
            let strip = |s: &str| -> String {
                let from = s.find(" FROM ").unwrap();
                let tail = &s[from..];
                let tail = tail.split(" ORDER BY ").next().unwrap();
                let tail = tail.split(" LIMIT ").next().unwrap();
                tail.chars().filter(|c| !c.is_ascii_digit()).collect()
            };
            assert_eq!(strip(&pair.select.sql), strip(&pair.count.sql), "{}", label);
        }
    }

    #[test]
    fn test_radius_always_carries_envelope() {
        let center = GeoPoint::new(35.0, 139.0).unwrap();
        let p = Predicate::new().within_radius("m.location", center, 1500.0);
        let pair = SelectBuilder::new("m.id", "measurements m")
            .filter(p)
            .build(Limit::clamped(None, BOUNDS));
        let sql = &pair.select.sql;
        assert!(sql.contains("m.location && ST_MakeEnvelope($1, $2, $3, $4, 4326)"), "{}", sql);
        assert!(sql.contains("ST_DWithin(m.location::geography"), "{}", sql);
        let envelope = sql.find("&& ST_MakeEnvelope").unwrap();
        let dwithin = sql.find("ST_DWithin").unwrap();
        assert!(envelope < dwithin);
    }

    #[test]
    fn test_radius_envelope_never_narrower_than_distance() {
        let center = GeoPoint::new(35.0, 139.0).unwrap();
        let p = Predicate::new().within_radius("m.location", center, 1500.0);
        let floats: Vec<f64> = p.args()[..4]
            .iter()
            .map(|a| match a {
                SqlArg::Float(v) => *v,
                other => panic!("unexpected envelope arg {:?}", other),
            })
            .collect();
        let (min_lon, min_lat, max_lon, max_lat) = (floats[0], floats[1], floats[2], floats[3]);

        // Every envelope edge sits at or beyond the ST_DWithin distance.
        for (lat, lon) in [(max_lat, 139.0), (min_lat, 139.0), (35.0, max_lon), (35.0, min_lon)] {
            let d = crate::geo::haversine_m(35.0, 139.0, lat, lon);
            assert!(d >= 1500.0 - 1e-6, "envelope edge only {} m away", d);
        }
    }

    #[test]
    fn test_box_uses_envelope_and_covers() {
        let bbox = BoundingBox::new(35.0, 36.0, 139.0, 140.0).unwrap();
        let p = Predicate::new().within_box("m.location", &bbox);
        assert_eq!(p.args().len(), 8);
        assert_eq!(p.args()[0], SqlArg::Float(139.0));
        assert_eq!(p.args()[1], SqlArg::Float(35.0));
        let pair = SelectBuilder::new("m.id", "measurements m")
            .filter(p)
            .build(Limit::clamped(None, BOUNDS));
        assert!(pair.count.sql.contains("ST_Covers(ST_MakeEnvelope($5, $6, $7, $8, 4326), m.location)"));
    }

    #[test]
    fn test_limit_is_bound_not_interpolated() {
        let pair = SelectBuilder::new("m.id", "measurements m")
            .build(Limit::clamped(Some(100_000), BOUNDS));
        assert!(pair.select.sql.ends_with("LIMIT $1"));
        assert_eq!(pair.select.args, vec![SqlArg::Int(200)]);
        assert!(!pair.count.sql.contains("LIMIT"));
    }

    #[test]
    fn test_like_pattern_escapes_metacharacters() {
        assert_eq!(like_pattern("abc"), "%abc%");
        assert_eq!(like_pattern("50%_x\\"), "%50\\%\\_x\\\\%");
    }

    #[test]
    fn test_ilike_term_never_reaches_sql_text() {
        let p = Predicate::new().ilike("t.uploader", "x'; DROP TABLE tracks; --");
        let pair = SelectBuilder::new("t.track_id", "tracks t")
            .filter(p)
            .build(Limit::clamped(None, BOUNDS));
        assert!(!pair.select.sql.contains("DROP"));
        assert_eq!(pair.select.placeholder_count(), 2);
    }

    #[test]
    fn test_escape_literal_question_mark_is_not_a_placeholder() {
        let s = Statement::new("SELECT '?' FROM t WHERE a = ?", vec![SqlArg::Int(1)]);
        assert_eq!(s.sql, "SELECT '?' FROM t WHERE a = $1");
        assert_eq!(s.placeholder_count(), 1);
    }

    #[test]
    fn test_open_window_adds_nothing() {
        let p = Predicate::new().time_window("m.captured_at", &TimeWindow::default());
        assert!(p.is_empty());
        let p = Predicate::new().any_text("m.device_id", &[]);
        assert!(p.is_empty());
    }
}
