use crate::domain::Rate;
use crate::errors::{RateError, RateResult};
use crate::storage::{Filter, Storage};
use async_trait::async_trait;
use parking_lot::Mutex;

/// In-memory [`Storage`] with the same filter semantics as the Postgres
/// implementation. Exists for tests only: the BTC processor and the REST
/// handlers run against it with canned data.
#[derive(Debug, Default)]
pub struct MemDb {
    inner: Mutex<Tables>,
}

#[derive(Debug, Default)]
struct Tables {
    btc: Vec<Rate>,
    refs: Vec<(String, i64)>,
    rub: Vec<Rate>,
    btc_seq: i64,
    rub_seq: i64,
}

impl MemDb {
    pub fn new() -> Self {
        Self::default()
    }

    /// A database pre-loaded with the sample reference sheet.
    pub fn seeded() -> Self {
        let db = Self::new();
        {
            let mut tables = db.inner.lock();
            for rate in [sample_usd(), sample_huf(), sample_gbp()] {
                tables.insert_fiat(&rate);
            }
        }
        db
    }

    /// Snapshot of the BTC table, for asserting on writes.
    pub fn btc_rows(&self) -> Vec<Rate> {
        self.inner.lock().btc.clone()
    }
}

impl Tables {
    fn insert_fiat(&mut self, rate: &Rate) {
        if !self.refs.iter().any(|(code, _)| code == &rate.char_code) {
            self.refs.push((rate.char_code.clone(), rate.nominal));
        }
        self.rub_seq += 1;
        self.rub.push(Rate {
            id: self.rub_seq,
            ..rate.clone()
        });
    }

    fn nominal_of(&self, char_code: &str) -> i64 {
        self.refs
            .iter()
            .find(|(code, _)| code == char_code)
            .map(|(_, nominal)| *nominal)
            .unwrap_or(0)
    }
}

fn matches(filter: &Filter, rate: &Rate) -> bool {
    if !filter.currency.is_empty() && rate.char_code != filter.currency {
        return false;
    }
    if filter.time > 0 && !filter.op.matches(rate.time, filter.time) {
        return false;
    }
    true
}

fn paginate(rows: Vec<Rate>, filter: &Filter) -> Vec<Rate> {
    let offset = filter.offset.max(0) as usize;
    let rows: Vec<Rate> = rows.into_iter().skip(offset).collect();
    if filter.limit > 0 {
        rows.into_iter().take(filter.limit as usize).collect()
    } else {
        rows
    }
}

#[async_trait]
impl Storage for MemDb {
    async fn add_btc_rate(&self, rate: &Rate) -> RateResult<()> {
        let mut tables = self.inner.lock();
        tables.btc_seq += 1;
        let id = tables.btc_seq;
        tables.btc.push(Rate {
            id,
            ..rate.clone()
        });
        Ok(())
    }

    async fn add_fiats(&self, rates: &[Rate]) -> RateResult<()> {
        let mut tables = self.inner.lock();
        for rate in rates {
            tables.insert_fiat(rate);
        }
        Ok(())
    }

    async fn rub_usd_rate(&self) -> RateResult<Rate> {
        let tables = self.inner.lock();
        tables
            .rub
            .iter()
            .filter(|r| r.char_code == "USD")
            .max_by_key(|r| (r.time, r.id))
            .cloned()
            .ok_or_else(|| RateError::Storage("no RUB/USD reference row".to_string()))
    }

    async fn btc_rate(&self, filter: &Filter) -> RateResult<Vec<Rate>> {
        let tables = self.inner.lock();
        // The currency predicate never applies to the single-instrument table.
        let mut rows: Vec<Rate> = tables
            .btc
            .iter()
            .filter(|r| filter.time == 0 || filter.op.matches(r.time, filter.time))
            .cloned()
            .collect();
        rows.sort_by_key(|r| std::cmp::Reverse(r.id));
        Ok(paginate(rows, filter))
    }

    async fn fiats(&self, filter: &Filter) -> RateResult<Vec<Rate>> {
        let tables = self.inner.lock();
        let mut rows: Vec<Rate> = tables
            .rub
            .iter()
            .filter(|r| matches(filter, r))
            .map(|r| Rate {
                nominal: tables.nominal_of(&r.char_code),
                ..r.clone()
            })
            .collect();
        rows.sort_by_key(|r| (r.time, r.id));
        Ok(paginate(rows, filter))
    }

    async fn fiats_current(&self) -> RateResult<Vec<Rate>> {
        let tables = self.inner.lock();
        let mut rows = Vec::with_capacity(tables.refs.len());
        for (char_code, nominal) in &tables.refs {
            if let Some(latest) = tables
                .rub
                .iter()
                .filter(|r| &r.char_code == char_code)
                .max_by_key(|r| (r.time, r.id))
            {
                rows.push(Rate {
                    nominal: *nominal,
                    ..latest.clone()
                });
            }
        }
        Ok(rows)
    }

    async fn close(&self) {}
}

pub fn sample_usd() -> Rate {
    Rate {
        id: 1,
        char_code: "USD".to_string(),
        nominal: 1,
        time: 1658252361,
        value: 56.4783,
    }
}

pub fn sample_huf() -> Rate {
    Rate {
        id: 2,
        char_code: "HUF".to_string(),
        nominal: 100,
        time: 1658252361,
        value: 14.3324,
    }
}

pub fn sample_gbp() -> Rate {
    Rate {
        id: 3,
        char_code: "GBP".to_string(),
        nominal: 1,
        time: 1658252361,
        value: 67.7627,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::Op;

    fn fiat(code: &str, nominal: i64, time: i64, value: f64) -> Rate {
        Rate {
            id: 0,
            char_code: code.to_string(),
            nominal,
            time,
            value,
        }
    }

    fn btc(time: i64, value: f64) -> Rate {
        Rate {
            id: 0,
            char_code: String::new(),
            nominal: 0,
            time,
            value,
        }
    }

    #[tokio::test]
    async fn btc_rows_come_back_id_descending() {
        let db = MemDb::new();
        for (time, value) in [(10, 1.0), (20, 2.0), (30, 3.0)] {
            db.add_btc_rate(&btc(time, value)).await.expect("add");
        }

        let rows = db.btc_rate(&Filter::default()).await.expect("read");
        let ids: Vec<i64> = rows.iter().map(|r| r.id).collect();
        assert_eq!(ids, vec![3, 2, 1]);

        let latest = db.btc_rate(&Filter::latest()).await.expect("read");
        assert_eq!(latest.len(), 1);
        assert_eq!(latest[0].value, 3.0);
    }

    #[tokio::test]
    async fn btc_time_bound_uses_the_operator() {
        let db = MemDb::new();
        for (time, value) in [(10, 1.0), (20, 2.0), (30, 3.0)] {
            db.add_btc_rate(&btc(time, value)).await.expect("add");
        }

        let filter = Filter {
            op: Op::Gte,
            time: 20,
            ..Filter::default()
        };
        let rows = db.btc_rate(&filter).await.expect("read");
        assert_eq!(rows.len(), 2);
        assert!(rows.iter().all(|r| r.time >= 20));

        let filter = Filter {
            op: Op::Lte,
            time: 20,
            offset: 1,
            ..Filter::default()
        };
        let rows = db.btc_rate(&filter).await.expect("read");
        assert_eq!(rows.len(), 1, "offset applies after the bound");
        assert_eq!(rows[0].time, 10);
    }

    #[tokio::test]
    async fn add_fiats_upserts_the_reference_set() {
        let db = MemDb::new();
        db.add_fiats(&[fiat("USD", 1, 100, 60.0)]).await.expect("add");
        db.add_fiats(&[fiat("USD", 1, 200, 61.0)]).await.expect("add");

        let current = db.fiats_current().await.expect("read");
        assert_eq!(current.len(), 1, "one reference entry per symbol");
        assert_eq!(current[0].value, 61.0, "latest observation wins");

        let history = db.fiats(&Filter::default()).await.expect("read");
        assert_eq!(history.len(), 2, "both observations kept");
        assert!(history[0].time < history[1].time, "time ascending");
    }

    #[tokio::test]
    async fn fiats_filters_by_currency() {
        let db = MemDb::seeded();
        let filter = Filter {
            currency: "HUF".to_string(),
            ..Filter::default()
        };
        let rows = db.fiats(&filter).await.expect("read");
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].char_code, "HUF");
        assert_eq!(rows[0].nominal, 100);
    }

    #[tokio::test]
    async fn rub_usd_rate_returns_newest_usd_row() {
        let db = MemDb::seeded();
        db.add_fiats(&[fiat("USD", 1, 1658338761, 57.1)]).await.expect("add");

        let rub_usd = db.rub_usd_rate().await.expect("read");
        assert_eq!(rub_usd.value, 57.1);

        let empty = MemDb::new();
        assert!(empty.rub_usd_rate().await.is_err());
    }
}
