//! Statement text shared by the SQL backends.
//!
//! Every SQL backend issues the same six statements against a table named
//! after the store; only the placeholder syntax differs between drivers.

/// Placeholder syntax of a driver.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParamStyle {
    /// `?` (SQLite, MySQL)
    Qmark,
    /// `$1`, `$2`, ... (PostgreSQL)
    Numeric,
}

impl ParamStyle {
    fn param(self, n: usize) -> String {
        match self {
            ParamStyle::Qmark => "?".to_string(),
            ParamStyle::Numeric => format!("${}", n),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Statements {
    pub create_table: String,
    /// Binds the cutoff timestamp.
    pub purge: String,
    /// Binds the id.
    pub select: String,
    /// Binds id, value.
    pub insert: String,
    /// Binds value, id.
    pub update: String,
    /// Binds the id.
    pub delete: String,
}

impl Statements {
    /// `table` must already be a safe identifier; store names are validated on open.
    pub fn new(table: &str, style: ParamStyle) -> Self {
        let p = |n| style.param(n);
        Statements {
            create_table: format!(
                "CREATE TABLE IF NOT EXISTS {} (id VARCHAR(64) NOT NULL PRIMARY KEY, value BIGINT NOT NULL)",
                table
            ),
            purge: format!("DELETE FROM {} WHERE value < {}", table, p(1)),
            select: format!("SELECT value FROM {} WHERE id = {}", table, p(1)),
            insert: format!("INSERT INTO {} (id, value) VALUES ({}, {})", table, p(1), p(2)),
            update: format!("UPDATE {} SET value = {} WHERE id = {}", table, p(1), p(2)),
            delete: format!("DELETE FROM {} WHERE id = {}", table, p(1)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_qmark_statements() {
        let st = Statements::new("greylist_passed", ParamStyle::Qmark);
        assert_eq!(st.select, "SELECT value FROM greylist_passed WHERE id = ?");
        assert_eq!(
            st.insert,
            "INSERT INTO greylist_passed (id, value) VALUES (?, ?)"
        );
        assert_eq!(st.purge, "DELETE FROM greylist_passed WHERE value < ?");
    }

    #[test]
    fn test_numeric_statements() {
        let st = Statements::new("whitelist", ParamStyle::Numeric);
        assert_eq!(st.update, "UPDATE whitelist SET value = $1 WHERE id = $2");
        assert_eq!(st.delete, "DELETE FROM whitelist WHERE id = $1");
        assert!(st.create_table.starts_with("CREATE TABLE IF NOT EXISTS whitelist ("));
    }
}
