//! PostgreSQL error store implementation.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgArguments, PgPool, PgPoolOptions, PgRow};
use sqlx::{Postgres, Row};
use uuid::Uuid;

use crate::error::{AggregatorError, Result};
use crate::types::{AggregateError, AggregateId, ErrorInstance, ErrorLevel, InstanceId, Project};

use super::{AggregateFilter, ErrorStore, InstanceFilter};

const AGGREGATE_COLUMNS: &str = "id, project, error_type, backtrace, fingerprint, active, \
     count, first_occurrence, last_occurrence, last_message, level, environments, servers";

const INSTANCE_COLUMNS: &str = "id, project, aggregate_id, environment, server, level, \
     occurred_at, message, log_message, backtrace, context, affected_user";

const INSERT_AGGREGATE: &str = "INSERT INTO aggregate_errors (id, project, error_type, \
     backtrace, fingerprint, active, count, first_occurrence, last_occurrence, last_message, \
     level, environments, servers) \
     VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)";

const INSERT_INSTANCE: &str = "INSERT INTO error_instances (id, project, aggregate_id, \
     environment, server, level, occurred_at, message, log_message, backtrace, context, \
     affected_user) \
     VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)";

type PgQuery<'q> = sqlx::query::Query<'q, Postgres, PgArguments>;

/// PostgreSQL-backed error store.
#[derive(Clone)]
pub struct PostgresStore {
    pool: PgPool,
}

impl PostgresStore {
    /// Connect to PostgreSQL and create a new store.
    ///
    /// The required tables are created if they don't exist.
    pub async fn new(url: &str, max_connections: u32) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(url)
            .await?;

        Self::from_pool(pool).await
    }

    /// Create a store from an existing connection pool.
    pub async fn from_pool(pool: PgPool) -> Result<Self> {
        let store = Self { pool };
        store.ensure_schema().await?;
        Ok(store)
    }

    async fn ensure_schema(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS projects (
                name TEXT PRIMARY KEY,
                created_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS aggregate_errors (
                id UUID PRIMARY KEY,
                project TEXT NOT NULL REFERENCES projects(name),
                error_type TEXT NOT NULL,
                backtrace TEXT NOT NULL,
                fingerprint TEXT NOT NULL,
                active BOOLEAN NOT NULL DEFAULT TRUE,
                count BIGINT NOT NULL,
                first_occurrence TIMESTAMPTZ NOT NULL,
                last_occurrence TIMESTAMPTZ NOT NULL,
                last_message TEXT NOT NULL,
                level TEXT NOT NULL,
                environments TEXT[] NOT NULL,
                servers TEXT[] NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS error_instances (
                id UUID PRIMARY KEY,
                project TEXT NOT NULL,
                aggregate_id UUID NOT NULL REFERENCES aggregate_errors(id) ON DELETE CASCADE,
                environment TEXT NOT NULL,
                server TEXT NOT NULL,
                level TEXT NOT NULL,
                occurred_at TIMESTAMPTZ NOT NULL,
                message TEXT NOT NULL,
                log_message TEXT,
                backtrace TEXT NOT NULL,
                context JSONB,
                affected_user BIGINT
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE INDEX IF NOT EXISTS idx_aggregate_errors_lookup
            ON aggregate_errors (project, fingerprint, active)
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE INDEX IF NOT EXISTS idx_aggregate_errors_last_occurrence
            ON aggregate_errors (last_occurrence DESC)
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE INDEX IF NOT EXISTS idx_error_instances_aggregate
            ON error_instances (aggregate_id, occurred_at DESC)
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE INDEX IF NOT EXISTS idx_error_instances_project_time
            ON error_instances (project, occurred_at DESC)
            "#,
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    fn parse_level(raw: &str) -> Result<ErrorLevel> {
        raw.parse()
            .map_err(|e| AggregatorError::Serialisation(format!("failed to parse level: {e}")))
    }

    fn row_to_aggregate(row: &PgRow) -> Result<AggregateError> {
        let id: Uuid = row.get("id");
        let count: i64 = row.get("count");
        let level: String = row.get("level");
        let environments: Vec<String> = row.get("environments");
        let servers: Vec<String> = row.get("servers");

        Ok(AggregateError {
            id: AggregateId::from_uuid(id),
            project: row.get("project"),
            error_type: row.get("error_type"),
            backtrace: row.get("backtrace"),
            fingerprint: row.get("fingerprint"),
            active: row.get("active"),
            count: u64::try_from(count).map_err(|_| {
                AggregatorError::Serialisation(format!("negative count {count} for aggregate {id}"))
            })?,
            first_occurrence: row.get("first_occurrence"),
            last_occurrence: row.get("last_occurrence"),
            last_message: row.get("last_message"),
            level: Self::parse_level(&level)?,
            environments: environments.into_iter().collect(),
            servers: servers.into_iter().collect(),
        })
    }

    fn row_to_instance(row: &PgRow) -> Result<ErrorInstance> {
        let id: Uuid = row.get("id");
        let aggregate_id: Uuid = row.get("aggregate_id");
        let level: String = row.get("level");

        Ok(ErrorInstance {
            id: InstanceId::from_uuid(id),
            project: row.get("project"),
            aggregate_id: AggregateId::from_uuid(aggregate_id),
            environment: row.get("environment"),
            server: row.get("server"),
            level: Self::parse_level(&level)?,
            occurred_at: row.get("occurred_at"),
            message: row.get("message"),
            log_message: row.get("log_message"),
            backtrace: row.get("backtrace"),
            context: row.get("context"),
            affected_user: row.get("affected_user"),
        })
    }

    fn insert_aggregate_query(aggregate: &AggregateError) -> Result<PgQuery<'_>> {
        let environments: Vec<String> = aggregate.environments.iter().cloned().collect();
        let servers: Vec<String> = aggregate.servers.iter().cloned().collect();

        Ok(sqlx::query(INSERT_AGGREGATE)
            .bind(aggregate.id.as_uuid())
            .bind(&aggregate.project)
            .bind(&aggregate.error_type)
            .bind(&aggregate.backtrace)
            .bind(&aggregate.fingerprint)
            .bind(aggregate.active)
            .bind(Self::count_param(aggregate.count)?)
            .bind(aggregate.first_occurrence)
            .bind(aggregate.last_occurrence)
            .bind(&aggregate.last_message)
            .bind(aggregate.level.as_str())
            .bind(environments)
            .bind(servers))
    }

    fn insert_instance_query(instance: &ErrorInstance) -> PgQuery<'_> {
        sqlx::query(INSERT_INSTANCE)
            .bind(instance.id.as_uuid())
            .bind(&instance.project)
            .bind(instance.aggregate_id.as_uuid())
            .bind(&instance.environment)
            .bind(&instance.server)
            .bind(instance.level.as_str())
            .bind(instance.occurred_at)
            .bind(&instance.message)
            .bind(&instance.log_message)
            .bind(&instance.backtrace)
            .bind(&instance.context)
            .bind(instance.affected_user)
    }

    fn count_param(count: u64) -> Result<i64> {
        i64::try_from(count)
            .map_err(|_| AggregatorError::Serialisation(format!("count {count} out of range")))
    }
}

#[async_trait]
impl ErrorStore for PostgresStore {
    async fn get_or_create_project(&self, name: &str) -> Result<Project> {
        let row = sqlx::query(
            r#"
            INSERT INTO projects (name)
            VALUES ($1)
            ON CONFLICT (name) DO UPDATE SET name = EXCLUDED.name
            RETURNING name, created_at
            "#,
        )
        .bind(name)
        .fetch_one(&self.pool)
        .await?;

        Ok(Project {
            name: row.get("name"),
            created_at: row.get("created_at"),
        })
    }

    async fn insert_aggregate(&self, aggregate: &AggregateError) -> Result<()> {
        Self::insert_aggregate_query(aggregate)?
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    async fn create_aggregate(
        &self,
        aggregate: &AggregateError,
        instance: &ErrorInstance,
    ) -> Result<()> {
        let mut tx = self.pool.begin().await?;

        Self::insert_aggregate_query(aggregate)?
            .execute(&mut *tx)
            .await?;
        Self::insert_instance_query(instance).execute(&mut *tx).await?;

        tx.commit().await?;
        Ok(())
    }

    async fn get_aggregate(&self, id: &AggregateId) -> Result<Option<AggregateError>> {
        let row = sqlx::query(&format!(
            "SELECT {AGGREGATE_COLUMNS} FROM aggregate_errors WHERE id = $1"
        ))
        .bind(id.as_uuid())
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(Self::row_to_aggregate).transpose()
    }

    async fn update_aggregate(&self, aggregate: &AggregateError) -> Result<()> {
        let environments: Vec<String> = aggregate.environments.iter().cloned().collect();
        let servers: Vec<String> = aggregate.servers.iter().cloned().collect();

        let result = sqlx::query(
            r#"
            UPDATE aggregate_errors
            SET backtrace = $2, count = $3, first_occurrence = $4,
                last_occurrence = $5, last_message = $6, level = $7,
                environments = $8, servers = $9
            WHERE id = $1
            "#,
        )
        .bind(aggregate.id.as_uuid())
        .bind(&aggregate.backtrace)
        .bind(Self::count_param(aggregate.count)?)
        .bind(aggregate.first_occurrence)
        .bind(aggregate.last_occurrence)
        .bind(&aggregate.last_message)
        .bind(aggregate.level.as_str())
        .bind(&environments)
        .bind(&servers)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(AggregatorError::AggregateNotFound(aggregate.id.to_string()));
        }

        Ok(())
    }

    async fn deactivate_aggregate(&self, id: &AggregateId) -> Result<bool> {
        let mut tx = self.pool.begin().await?;

        let row = sqlx::query("SELECT active FROM aggregate_errors WHERE id = $1 FOR UPDATE")
            .bind(id.as_uuid())
            .fetch_optional(&mut *tx)
            .await?
            .ok_or_else(|| AggregatorError::AggregateNotFound(id.to_string()))?;
        let was_active: bool = row.get("active");

        if was_active {
            sqlx::query("UPDATE aggregate_errors SET active = FALSE WHERE id = $1")
                .bind(id.as_uuid())
                .execute(&mut *tx)
                .await?;
        }

        tx.commit().await?;
        Ok(was_active)
    }

    async fn find_active(&self, project: &str, fingerprint: &str) -> Result<Vec<AggregateError>> {
        let rows = sqlx::query(&format!(
            "SELECT {AGGREGATE_COLUMNS} FROM aggregate_errors \
             WHERE project = $1 AND fingerprint = $2 AND active \
             ORDER BY first_occurrence ASC, id ASC"
        ))
        .bind(project)
        .bind(fingerprint)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(Self::row_to_aggregate).collect()
    }

    async fn list_aggregates(&self, filter: &AggregateFilter) -> Result<Vec<AggregateError>> {
        let mut query = format!("SELECT {AGGREGATE_COLUMNS} FROM aggregate_errors WHERE 1=1");

        let mut params: Vec<String> = Vec::new();

        if let Some(ref project) = filter.project {
            params.push(project.clone());
            query.push_str(&format!(" AND project = ${}", params.len()));
        }

        if let Some(active) = filter.active {
            params.push(active.to_string());
            query.push_str(&format!(" AND active = ${}::boolean", params.len()));
        }

        query.push_str(" ORDER BY last_occurrence DESC, id ASC");

        if let Some(limit) = filter.limit {
            query.push_str(&format!(" LIMIT {limit}"));
        }

        if let Some(offset) = filter.offset {
            query.push_str(&format!(" OFFSET {offset}"));
        }

        let mut sqlx_query = sqlx::query(&query);
        for param in &params {
            sqlx_query = sqlx_query.bind(param);
        }

        let rows = sqlx_query.fetch_all(&self.pool).await?;

        rows.iter().map(Self::row_to_aggregate).collect()
    }

    async fn insert_instance(&self, instance: &ErrorInstance) -> Result<()> {
        Self::insert_instance_query(instance)
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    async fn get_instances(
        &self,
        ids: &[InstanceId],
    ) -> Result<HashMap<InstanceId, ErrorInstance>> {
        if ids.is_empty() {
            return Ok(HashMap::new());
        }

        let uuids: Vec<Uuid> = ids.iter().map(|id| *id.as_uuid()).collect();

        let rows = sqlx::query(&format!(
            "SELECT {INSTANCE_COLUMNS} FROM error_instances WHERE id = ANY($1)"
        ))
        .bind(&uuids)
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| Self::row_to_instance(row).map(|i| (i.id, i)))
            .collect()
    }

    async fn list_instances(&self, filter: &InstanceFilter) -> Result<Vec<ErrorInstance>> {
        let mut query = format!("SELECT {INSTANCE_COLUMNS} FROM error_instances WHERE 1=1");

        let mut params: Vec<String> = Vec::new();

        if let Some(ref project) = filter.project {
            params.push(project.clone());
            query.push_str(&format!(" AND project = ${}", params.len()));
        }

        if let Some(aggregate_id) = filter.aggregate_id {
            params.push(aggregate_id.to_string());
            query.push_str(&format!(" AND aggregate_id = ${}::uuid", params.len()));
        }

        if let Some(ref environment) = filter.environment {
            params.push(environment.clone());
            query.push_str(&format!(" AND environment = ${}", params.len()));
        }

        if let Some(ref server) = filter.server {
            params.push(server.clone());
            query.push_str(&format!(" AND server = ${}", params.len()));
        }

        if let Some(user) = filter.affected_user {
            params.push(user.to_string());
            query.push_str(&format!(" AND affected_user = ${}::bigint", params.len()));
        }

        if let Some(since) = filter.since {
            params.push(since.to_rfc3339());
            query.push_str(&format!(" AND occurred_at >= ${}::timestamptz", params.len()));
        }

        query.push_str(" ORDER BY occurred_at DESC, id ASC");

        if let Some(limit) = filter.limit {
            query.push_str(&format!(" LIMIT {limit}"));
        }

        let mut sqlx_query = sqlx::query(&query);
        for param in &params {
            sqlx_query = sqlx_query.bind(param);
        }

        let rows = sqlx_query.fetch_all(&self.pool).await?;

        rows.iter().map(Self::row_to_instance).collect()
    }

    async fn count_instances(&self, project: Option<&str>, since: DateTime<Utc>) -> Result<u64> {
        let row = sqlx::query(
            r#"
            SELECT COUNT(*) AS total
            FROM error_instances
            WHERE ($1::text IS NULL OR project = $1) AND occurred_at >= $2
            "#,
        )
        .bind(project)
        .bind(since)
        .fetch_one(&self.pool)
        .await?;

        let total: i64 = row.get("total");
        Ok(u64::try_from(total).unwrap_or(0))
    }
}

impl std::fmt::Debug for PostgresStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PostgresStore").finish_non_exhaustive()
    }
}
