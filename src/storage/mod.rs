use crate::domain::Rate;
use crate::errors::RateResult;
use async_trait::async_trait;

pub mod memdb;
pub mod postgres;

/// Comparison applied between stored `time` and [`Filter::time`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Op {
    #[default]
    Eq,
    Lte,
    Gte,
}

impl Op {
    pub fn as_sql(self) -> &'static str {
        match self {
            Op::Eq => "=",
            Op::Lte => "<=",
            Op::Gte => ">=",
        }
    }

    pub fn matches(self, stored: i64, bound: i64) -> bool {
        match self {
            Op::Eq => stored == bound,
            Op::Lte => stored <= bound,
            Op::Gte => stored >= bound,
        }
    }
}

/// Query predicate for storage reads.
///
/// `time = 0` means no time bound, `limit = 0` means no limit, `currency`
/// empty means all symbols. `offset` is always honoured.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Filter {
    pub op: Op,
    pub currency: String,
    pub time: i64,
    pub limit: i64,
    pub offset: i64,
}

impl Filter {
    /// The newest row only.
    pub fn latest() -> Self {
        Filter {
            limit: 1,
            ..Filter::default()
        }
    }
}

/// Capability surface shared by the pipelines and the REST API.
#[async_trait]
pub trait Storage: Send + Sync {
    /// Appends one BTC/USDT observation.
    async fn add_btc_rate(&self, rate: &Rate) -> RateResult<()>;

    /// Atomic batch: upserts `(char_code, nominal)` reference tuples, then
    /// appends one time-series row per rate. Never partially committed.
    async fn add_fiats(&self, rates: &[Rate]) -> RateResult<()>;

    /// The newest fiat row whose `char_code = "USD"`.
    async fn rub_usd_rate(&self) -> RateResult<Rate>;

    /// BTC observations matching `filter`, ordered by id descending.
    async fn btc_rate(&self, filter: &Filter) -> RateResult<Vec<Rate>>;

    /// Fiat observations matching `filter`, ordered by time ascending.
    async fn fiats(&self, filter: &Filter) -> RateResult<Vec<Rate>>;

    /// For each known fiat symbol, its most recent observation.
    async fn fiats_current(&self) -> RateResult<Vec<Rate>>;

    /// Releases the pool; idempotent.
    async fn close(&self);
}
