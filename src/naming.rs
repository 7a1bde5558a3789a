//! Constraint naming convention shared by every metadata object.
//!
//! Templates use `%(token)s` placeholders. Supported tokens: `table_name`,
//! `column_0_name`, `column_0_label` (`<table>_<column>`), `constraint_name`
//! and `referred_table_name`.

use regex::Regex;
use std::collections::BTreeMap;
use std::sync::OnceLock;

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ConstraintKind {
    Index,
    Unique,
    Check,
    ForeignKey,
    PrimaryKey,
}

impl ConstraintKind {
    pub fn key(self) -> &'static str {
        match self {
            ConstraintKind::Index => "ix",
            ConstraintKind::Unique => "uq",
            ConstraintKind::Check => "ck",
            ConstraintKind::ForeignKey => "fk",
            ConstraintKind::PrimaryKey => "pk",
        }
    }
}

/// Values substituted into a template.
#[derive(Clone, Debug, Default)]
pub struct ConstraintTarget<'a> {
    pub table: &'a str,
    pub column: Option<&'a str>,
    pub constraint: Option<&'a str>,
    pub referred_table: Option<&'a str>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NamingConvention {
    templates: BTreeMap<ConstraintKind, String>,
}

impl Default for NamingConvention {
    fn default() -> Self {
        NamingConvention::new([
            (ConstraintKind::Index, "ix_%(column_0_label)s"),
            (ConstraintKind::Unique, "uq_%(table_name)s_%(column_0_name)s"),
            (ConstraintKind::Check, "ck_%(table_name)s_%(constraint_name)s"),
            (
                ConstraintKind::ForeignKey,
                "fk_%(table_name)s_%(column_0_name)s_%(referred_table_name)s",
            ),
            (ConstraintKind::PrimaryKey, "pk_%(table_name)s"),
        ])
    }
}

fn token_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"%\((\w+)\)s").expect("static naming token pattern"))
}

impl NamingConvention {
    pub fn new<'a>(templates: impl IntoIterator<Item = (ConstraintKind, &'a str)>) -> Self {
        NamingConvention {
            templates: templates
                .into_iter()
                .map(|(k, t)| (k, t.to_string()))
                .collect(),
        }
    }

    pub fn template(&self, kind: ConstraintKind) -> Option<&str> {
        self.templates.get(&kind).map(String::as_str)
    }

    /// Render the constraint name for `kind`. Returns None when the convention
    /// has no template for that kind. Unknown or unset tokens render empty.
    pub fn render(&self, kind: ConstraintKind, target: &ConstraintTarget<'_>) -> Option<String> {
        let template = self.template(kind)?;
        let rendered = token_pattern().replace_all(template, |caps: &regex::Captures<'_>| {
            match &caps[1] {
                "table_name" => target.table.to_string(),
                "column_0_name" => target.column.unwrap_or_default().to_string(),
                "column_0_label" => match target.column {
                    Some(c) => format!("{}_{}", target.table, c),
                    None => target.table.to_string(),
                },
                "constraint_name" => target.constraint.unwrap_or_default().to_string(),
                "referred_table_name" => target.referred_table.unwrap_or_default().to_string(),
                _ => String::new(),
            }
        });
        Some(rendered.into_owned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn target<'a>(column: Option<&'a str>) -> ConstraintTarget<'a> {
        ConstraintTarget {
            table: "users",
            column,
            ..Default::default()
        }
    }

    #[test]
    fn default_convention_names() {
        let nc = NamingConvention::default();
        assert_eq!(
            nc.render(ConstraintKind::PrimaryKey, &target(None)).as_deref(),
            Some("pk_users")
        );
        assert_eq!(
            nc.render(ConstraintKind::Unique, &target(Some("email"))).as_deref(),
            Some("uq_users_email")
        );
        assert_eq!(
            nc.render(ConstraintKind::Index, &target(Some("email"))).as_deref(),
            Some("ix_users_email")
        );
        let check = ConstraintTarget {
            table: "users",
            constraint: Some("age_positive"),
            ..Default::default()
        };
        assert_eq!(
            nc.render(ConstraintKind::Check, &check).as_deref(),
            Some("ck_users_age_positive")
        );
        let fk = ConstraintTarget {
            table: "orders",
            column: Some("user_id"),
            referred_table: Some("users"),
            ..Default::default()
        };
        assert_eq!(
            nc.render(ConstraintKind::ForeignKey, &fk).as_deref(),
            Some("fk_orders_user_id_users")
        );
    }

    #[test]
    fn missing_template_renders_nothing() {
        let nc = NamingConvention::new([(ConstraintKind::PrimaryKey, "pk_%(table_name)s")]);
        assert!(nc.render(ConstraintKind::Index, &target(Some("x"))).is_none());
    }
}
