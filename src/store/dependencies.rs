use std::collections::HashSet;

use sqlx::Row;

use super::Store;
use crate::types::{DependencyKind, TaskDependency};

impl Store {
    /// Insert a dependency edge. Rejects self-references and any edge that
    /// would close a cycle in the blocked-by graph.
    pub async fn add_dependency(&self, dep: &TaskDependency) -> anyhow::Result<()> {
        if dep.task_id == dep.blocked_by_task_id {
            anyhow::bail!("a task cannot block itself");
        }

        // Walk upward from the blocker: if we can reach task_id, the new
        // edge would create a cycle.
        let mut seen = HashSet::new();
        let mut frontier = vec![dep.blocked_by_task_id.clone()];
        while let Some(current) = frontier.pop() {
            if current == dep.task_id {
                anyhow::bail!(
                    "dependency cycle: {} already blocks {}",
                    dep.task_id,
                    dep.blocked_by_task_id
                );
            }
            if !seen.insert(current.clone()) {
                continue;
            }
            let rows = sqlx::query(
                "SELECT blocked_by_task_id FROM task_dependencies WHERE task_id = ?",
            )
            .bind(&current)
            .fetch_all(self.pool())
            .await?;
            for row in rows {
                frontier.push(row.get::<String, _>("blocked_by_task_id"));
            }
        }

        sqlx::query(
            "INSERT OR REPLACE INTO task_dependencies (task_id, blocked_by_task_id, kind)
             VALUES (?, ?, ?)",
        )
        .bind(&dep.task_id)
        .bind(&dep.blocked_by_task_id)
        .bind(dep.kind.as_str())
        .execute(self.pool())
        .await?;
        Ok(())
    }

    pub async fn list_dependencies(&self, task_id: &str) -> anyhow::Result<Vec<TaskDependency>> {
        let rows = sqlx::query("SELECT * FROM task_dependencies WHERE task_id = ?")
            .bind(task_id)
            .fetch_all(self.pool())
            .await?;
        Ok(rows
            .iter()
            .map(|row| {
                let kind_str: String = row.get("kind");
                TaskDependency {
                    task_id: row.get("task_id"),
                    blocked_by_task_id: row.get("blocked_by_task_id"),
                    kind: DependencyKind::parse(&kind_str).unwrap_or(DependencyKind::Blocks),
                }
            })
            .collect())
    }

    /// Ids of still-open (not completed) blockers for a task, considering
    /// only blocking-class edges.
    pub async fn open_blockers(&self, user: &str, task_id: &str) -> anyhow::Result<Vec<String>> {
        let rows = sqlx::query(
            "SELECT d.blocked_by_task_id FROM task_dependencies d
             JOIN tasks t ON t.id = d.blocked_by_task_id
             WHERE d.task_id = ? AND t.user = ? AND t.is_completed = 0
               AND d.kind IN ('blocks', 'depends_on')",
        )
        .bind(task_id)
        .bind(user)
        .fetch_all(self.pool())
        .await?;
        Ok(rows
            .iter()
            .map(|r| r.get::<String, _>("blocked_by_task_id"))
            .collect())
    }
}
