//! Built-in schema migrations for the repos/jobs/workers/users tables.

use super::runner::Migration;

const CINCH_INTERNAL_SQL: &str = include_str!("../../migrations/0000_cinch_internal.sql");

/// Applied in order before any user migrations.
pub fn get_builtin_migrations() -> Vec<Migration> {
    vec![Migration::new("0000_cinch_internal", CINCH_INTERNAL_SQL)]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builtin_migrations_not_empty() {
        let migrations = get_builtin_migrations();
        assert!(!migrations.is_empty());
        assert_eq!(migrations[0].name, "0000_cinch_internal");
    }

    #[test]
    fn builtin_sql_defines_core_tables() {
        let migrations = get_builtin_migrations();
        let sql = &migrations[0].up_sql;
        for table in ["repos", "jobs", "workers", "users", "tokens", "secrets_canary"] {
            assert!(
                sql.contains(&format!("CREATE TABLE IF NOT EXISTS {table}")),
                "missing table {table}"
            );
        }
    }
}
