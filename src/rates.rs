use crate::domain::{BtcPoint, Envelope, Rate, BTC_CROSS_LABEL, BTC_USDT_LABEL};
use crate::errors::{RateError, RateResult};
use crate::storage::{Filter, Storage};
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::mpsc;

/// Two quotes closer than this are the same quote.
pub const NOVELTY_EPSILON: f64 = 1e-9;

/// BTC processing stage: persists genuinely new quotes, derives cross-rates
/// and emits serialised envelopes for the hub.
///
/// The stage ends when its input closes; storage errors are reported and the
/// stage keeps consuming.
pub fn process_btc(
    db: Arc<dyn Storage>,
    mut input: mpsc::Receiver<Vec<Rate>>,
) -> (mpsc::Receiver<String>, mpsc::Receiver<RateError>) {
    let (out_tx, out_rx) = mpsc::channel(1);
    let (err_tx, err_rx) = mpsc::channel(2);

    tokio::spawn(async move {
        while let Some(batch) = input.recv().await {
            handle_btc_batch(&db, &out_tx, &err_tx, batch).await;
        }
    });

    (out_rx, err_rx)
}

/// Fiat processing stage: persists each decoded batch as one atomic unit.
pub fn process_fiats(
    db: Arc<dyn Storage>,
    mut input: mpsc::Receiver<Vec<Rate>>,
) -> mpsc::Receiver<RateError> {
    let (err_tx, err_rx) = mpsc::channel(2);

    tokio::spawn(async move {
        while let Some(batch) = input.recv().await {
            if let Err(e) = db.add_fiats(&batch).await {
                let _ = err_tx
                    .send(RateError::Storage(format!("process fiats update stream: {e}")))
                    .await;
            }
        }
    });

    err_rx
}

async fn handle_btc_batch(
    db: &Arc<dyn Storage>,
    out_tx: &mpsc::Sender<String>,
    err_tx: &mpsc::Sender<RateError>,
    batch: Vec<Rate>,
) {
    // One rate per batch is the norm; empty batches are skipped.
    let Some(rate) = batch.into_iter().next() else {
        return;
    };

    let previous = match db.btc_rate(&Filter::latest()).await {
        Ok(rows) => rows,
        Err(e) => {
            let _ = err_tx
                .send(RateError::Storage(format!("process btc update stream: {e}")))
                .await;
            return;
        }
    };
    if let Some(previous) = previous.first() {
        if (previous.value - rate.value).abs() <= NOVELTY_EPSILON {
            return;
        }
    }

    // Persist off the hot path; a failed insert must not hold up the push.
    {
        let db = db.clone();
        let err_tx = err_tx.clone();
        let row = rate.clone();
        tokio::spawn(async move {
            if let Err(e) = db.add_btc_rate(&row).await {
                let _ = err_tx.send(e).await;
            }
        });
    }

    ship(
        out_tx,
        err_tx,
        BTC_USDT_LABEL,
        &BtcPoint {
            timestamp: rate.time,
            value: rate.value,
        },
    )
    .await;

    match calc_rates(db.as_ref(), rate.value).await {
        Ok(cross) => ship(out_tx, err_tx, BTC_CROSS_LABEL, &cross).await,
        Err(e) => {
            let _ = err_tx
                .send(RateError::Storage(format!("process btc update stream: {e}")))
                .await;
        }
    }
}

async fn ship<T: Serialize>(
    out_tx: &mpsc::Sender<String>,
    err_tx: &mpsc::Sender<RateError>,
    label: &'static str,
    data: &T,
) {
    match serde_json::to_string(&Envelope { label, data }) {
        Ok(message) => {
            let _ = out_tx.send(message).await;
        }
        Err(e) => {
            let _ = err_tx.send(RateError::Serialize(e.to_string())).await;
        }
    }
}

/// Derives the fiat-to-BTC cross-rate map for one BTC/USDT quote.
///
/// The pivot is `rcc`, the BTC price in RUB. Every fiat with a non-zero
/// nominal contributes `rcc * nominal / value`; a zero nominal would divide
/// by zero and is excluded.
pub async fn calc_rates(db: &dyn Storage, btc_usd: f64) -> RateResult<BTreeMap<String, f64>> {
    let rub_usd = db.rub_usd_rate().await?;
    let fiats = db.fiats_current().await?;

    let rcc = btc_usd * rub_usd.value;

    let mut cross = BTreeMap::new();
    cross.insert("RUB".to_string(), rcc);
    for fiat in fiats {
        if fiat.nominal != 0 {
            cross.insert(fiat.char_code, rcc * fiat.nominal as f64 / fiat.value);
        }
    }

    Ok(cross)
}
