use crate::domain::Rate;
use crate::errors::{RateError, RateResult};
use crate::storage::{Filter, Storage};
use async_trait::async_trait;
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::{Postgres as Pg, QueryBuilder};

const SCHEMA: &str = include_str!("../../migrations/schema.sql");

/// Postgres-backed [`Storage`] over a shared connection pool.
#[derive(Debug, Clone)]
pub struct Postgres {
    pool: PgPool,
}

#[derive(sqlx::FromRow)]
struct BtcRow {
    id: i64,
    time: i64,
    value: f64,
}

impl From<BtcRow> for Rate {
    fn from(row: BtcRow) -> Self {
        Rate {
            id: row.id,
            char_code: String::new(),
            nominal: 0,
            time: row.time,
            value: row.value,
        }
    }
}

#[derive(sqlx::FromRow)]
struct FiatRow {
    id: i64,
    char_code: String,
    nominal: i64,
    time: i64,
    value: f64,
}

impl From<FiatRow> for Rate {
    fn from(row: FiatRow) -> Self {
        Rate {
            id: row.id,
            char_code: row.char_code,
            nominal: row.nominal,
            time: row.time,
            value: row.value,
        }
    }
}

impl Postgres {
    /// Connects and bootstraps the schema.
    pub async fn connect(url: &str) -> RateResult<Self> {
        let pool = PgPoolOptions::new().max_connections(5).connect(url).await?;
        sqlx::raw_sql(SCHEMA).execute(&pool).await?;
        Ok(Self { pool })
    }

    fn btc_query(filter: &Filter) -> QueryBuilder<'static, Pg> {
        let mut query = QueryBuilder::new("SELECT id, time, value FROM btc_usdt");
        if filter.time > 0 {
            query.push(" WHERE time ");
            query.push(filter.op.as_sql());
            query.push(" ");
            query.push_bind(filter.time);
        }
        query.push(" ORDER BY id DESC");
        push_pagination(&mut query, filter);
        query
    }

    fn fiats_query(filter: &Filter) -> QueryBuilder<'static, Pg> {
        let mut query = QueryBuilder::new(
            "SELECT rub.id, rub.char_code, fiats.nominal, rub.time, rub.value \
             FROM rub JOIN fiats ON rub.char_code = fiats.char_code",
        );
        let mut sep = " WHERE ";
        if !filter.currency.is_empty() {
            query.push(sep);
            query.push("rub.char_code = ");
            query.push_bind(filter.currency.clone());
            sep = " AND ";
        }
        if filter.time > 0 {
            query.push(sep);
            query.push("rub.time ");
            query.push(filter.op.as_sql());
            query.push(" ");
            query.push_bind(filter.time);
        }
        query.push(" ORDER BY rub.time ASC, rub.id ASC");
        push_pagination(&mut query, filter);
        query
    }
}

fn push_pagination(query: &mut QueryBuilder<'static, Pg>, filter: &Filter) {
    if filter.limit > 0 {
        query.push(" LIMIT ");
        query.push_bind(filter.limit);
    }
    query.push(" OFFSET ");
    query.push_bind(filter.offset);
}

#[async_trait]
impl Storage for Postgres {
    async fn add_btc_rate(&self, rate: &Rate) -> RateResult<()> {
        sqlx::query("INSERT INTO btc_usdt (time, value) VALUES ($1, $2)")
            .bind(rate.time)
            .bind(rate.value)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn add_fiats(&self, rates: &[Rate]) -> RateResult<()> {
        let mut tx = self.pool.begin().await?;

        for rate in rates {
            sqlx::query(
                "INSERT INTO fiats (char_code, nominal) VALUES ($1, $2) \
                 ON CONFLICT (char_code) DO NOTHING",
            )
            .bind(&rate.char_code)
            .bind(rate.nominal)
            .execute(&mut *tx)
            .await?;
        }

        for rate in rates {
            sqlx::query("INSERT INTO rub (char_code, time, value) VALUES ($1, $2, $3)")
                .bind(&rate.char_code)
                .bind(rate.time)
                .bind(rate.value)
                .execute(&mut *tx)
                .await?;
        }

        tx.commit().await?;
        Ok(())
    }

    async fn rub_usd_rate(&self) -> RateResult<Rate> {
        let row: Option<FiatRow> = sqlx::query_as(
            "SELECT rub.id, rub.char_code, fiats.nominal, rub.time, rub.value \
             FROM rub JOIN fiats ON rub.char_code = fiats.char_code \
             WHERE rub.char_code = $1 \
             ORDER BY rub.time DESC, rub.id DESC LIMIT 1",
        )
        .bind("USD")
        .fetch_optional(&self.pool)
        .await?;

        row.map(Rate::from)
            .ok_or_else(|| RateError::Storage("no RUB/USD reference row".to_string()))
    }

    async fn btc_rate(&self, filter: &Filter) -> RateResult<Vec<Rate>> {
        let rows: Vec<BtcRow> = Self::btc_query(filter)
            .build_query_as()
            .fetch_all(&self.pool)
            .await?;
        Ok(rows.into_iter().map(Rate::from).collect())
    }

    async fn fiats(&self, filter: &Filter) -> RateResult<Vec<Rate>> {
        let rows: Vec<FiatRow> = Self::fiats_query(filter)
            .build_query_as()
            .fetch_all(&self.pool)
            .await?;
        Ok(rows.into_iter().map(Rate::from).collect())
    }

    async fn fiats_current(&self) -> RateResult<Vec<Rate>> {
        let rows: Vec<FiatRow> = sqlx::query_as(
            "SELECT DISTINCT ON (rub.char_code) \
                 rub.id, rub.char_code, fiats.nominal, rub.time, rub.value \
             FROM rub JOIN fiats ON rub.char_code = fiats.char_code \
             ORDER BY rub.char_code, rub.time DESC, rub.id DESC",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(Rate::from).collect())
    }

    async fn close(&self) {
        self.pool.close().await;
    }
}
