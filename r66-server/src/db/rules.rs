//! Transfer rule database operations
//!
//! A rule names the task lists run around a transfer. Task lists are stored
//! as JSON arrays of [`TaskSpec`].

use serde::{Deserialize, Serialize};
use sqlx::sqlite::SqlitePool;

use crate::db::sql;
use crate::pipeline::TaskSpec;

/// A named set of pre-, post- and error-phase tasks
///
/// Rule files given to `r66d rule set` use the same JSON shape; missing task
/// lists are empty.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Rule {
    pub name: String,
    #[serde(default)]
    pub pre_tasks: Vec<TaskSpec>,
    #[serde(default)]
    pub post_tasks: Vec<TaskSpec>,
    #[serde(default)]
    pub error_tasks: Vec<TaskSpec>,
}

impl Rule {
    /// A rule with no tasks in any phase
    pub fn empty(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }
}

/// Row type for rule queries
type RuleRow = (String, String, String, String);

fn parse_tasks(column: &str, json: &str) -> Result<Vec<TaskSpec>, sqlx::Error> {
    serde_json::from_str(json).map_err(|e| sqlx::Error::ColumnDecode {
        index: column.to_string(),
        source: Box::new(e),
    })
}

fn encode_tasks(tasks: &[TaskSpec]) -> Result<String, sqlx::Error> {
    serde_json::to_string(tasks).map_err(|e| sqlx::Error::Encode(Box::new(e)))
}

impl TryFrom<RuleRow> for Rule {
    type Error = sqlx::Error;

    fn try_from(row: RuleRow) -> Result<Self, Self::Error> {
        Ok(Self {
            pre_tasks: parse_tasks("pre_tasks", &row.1)?,
            post_tasks: parse_tasks("post_tasks", &row.2)?,
            error_tasks: parse_tasks("error_tasks", &row.3)?,
            name: row.0,
        })
    }
}

/// Database access for rules
#[derive(Clone)]
pub struct RuleDb {
    pool: SqlitePool,
}

impl RuleDb {
    /// Create a new RuleDb instance
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Get a rule by name
    pub async fn get(&self, name: &str) -> Result<Option<Rule>, sqlx::Error> {
        let row: Option<RuleRow> = sqlx::query_as(sql::SQL_SELECT_RULE)
            .bind(name)
            .fetch_optional(&self.pool)
            .await?;

        row.map(Rule::try_from).transpose()
    }

    /// Create or replace a rule
    pub async fn upsert(&self, rule: &Rule) -> Result<(), sqlx::Error> {
        sqlx::query(sql::SQL_UPSERT_RULE)
            .bind(&rule.name)
            .bind(encode_tasks(&rule.pre_tasks)?)
            .bind(encode_tasks(&rule.post_tasks)?)
            .bind(encode_tasks(&rule.error_tasks)?)
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    /// List all rule names in alphabetical order
    pub async fn list(&self) -> Result<Vec<String>, sqlx::Error> {
        sqlx::query_scalar(sql::SQL_SELECT_RULE_NAMES)
            .fetch_all(&self.pool)
            .await
    }

    /// Delete a rule
    ///
    /// Returns true if the rule existed.
    pub async fn delete(&self, name: &str) -> Result<bool, sqlx::Error> {
        let result = sqlx::query(sql::SQL_DELETE_RULE)
            .bind(name)
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected() > 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::testing::create_test_db;
    use crate::pipeline::TaskKind;

    #[tokio::test]
    async fn test_default_rule_seeded() {
        let db = RuleDb::new(create_test_db().await);
        let rule = db.get("default").await.unwrap().unwrap();
        assert_eq!(rule, Rule::empty("default"));
    }

    #[tokio::test]
    async fn test_upsert_and_get() {
        let db = RuleDb::new(create_test_db().await);
        let rule = Rule {
            name: "archive".to_string(),
            pre_tasks: vec![TaskSpec::new(TaskKind::Log, "starting #FILENAME#")],
            post_tasks: vec![TaskSpec::new(TaskKind::Move, "/srv/archive")],
            error_tasks: vec![TaskSpec::new(TaskKind::Delete, "")],
        };

        db.upsert(&rule).await.unwrap();
        assert_eq!(db.get("archive").await.unwrap(), Some(rule.clone()));

        let replaced = Rule::empty("archive");
        db.upsert(&replaced).await.unwrap();
        assert_eq!(db.get("archive").await.unwrap(), Some(replaced));
    }

    #[tokio::test]
    async fn test_list_and_delete() {
        let db = RuleDb::new(create_test_db().await);
        db.upsert(&Rule::empty("zeta")).await.unwrap();
        db.upsert(&Rule::empty("alpha")).await.unwrap();

        assert_eq!(db.list().await.unwrap(), vec!["alpha", "default", "zeta"]);
        assert!(db.delete("zeta").await.unwrap());
        assert!(!db.delete("zeta").await.unwrap());
        assert!(db.get("zeta").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_corrupt_task_json_is_decode_error() {
        let pool = create_test_db().await;
        sqlx::query("UPDATE rules SET post_tasks = 'not json' WHERE name = 'default'")
            .execute(&pool)
            .await
            .unwrap();

        let db = RuleDb::new(pool);
        assert!(matches!(
            db.get("default").await,
            Err(sqlx::Error::ColumnDecode { .. })
        ));
    }
}
