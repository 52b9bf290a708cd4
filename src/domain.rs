use crate::errors::{RateError, RateResult};
use chrono::{DateTime, NaiveTime, Utc};
use quick_xml::events::Event;
use quick_xml::Reader;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

pub const BTC_USDT_LABEL: &str = "BTC/USDT";
pub const BTC_CROSS_LABEL: &str = "BTC/*";

/// One observation of an instrument against its reference unit.
///
/// `char_code` is empty for BTC/USDT observations and `nominal` is 0 for
/// them, which keeps BTC out of the fiat cross-rate loop. Fiat rows carry
/// the lot size the upstream sheet quotes (`nominal = 100` for HUF etc.).
#[derive(Debug, Clone, PartialEq)]
pub struct Rate {
    pub id: i64,
    pub char_code: String,
    pub nominal: i64,
    /// Epoch seconds, UTC. Midnight of ingestion day for fiat rows.
    pub time: i64,
    pub value: f64,
}

/// The labelled wrapper shipped to push subscribers.
#[derive(Debug, Serialize)]
pub struct Envelope<T> {
    pub label: &'static str,
    pub data: T,
}

/// Payload of the `"BTC/USDT"` envelope and the latest/history REST replies.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BtcPoint {
    pub timestamp: i64,
    pub value: f64,
}

// Upstream BTC quote: { "code": …, "data": { "time": ms, "buy": "22278.80" } }.
// Only the fields we consume are modelled.
#[derive(Deserialize)]
struct BtcStats {
    data: BtcQuote,
}

#[derive(Deserialize)]
struct BtcQuote {
    time: i64,
    buy: String,
}

/// Decodes one BTC/USDT quote body. The upstream timestamp is milliseconds;
/// the rate carries seconds.
pub fn json_dec(body: &[u8]) -> RateResult<Vec<Rate>> {
    let stats: BtcStats = serde_json::from_slice(body)?;
    let value: f64 = stats.data.buy.trim().parse()?;

    Ok(vec![Rate {
        id: 0,
        char_code: String::new(),
        nominal: 0,
        time: stats.data.time / 1000,
        value,
    }])
}

/// Decodes a `<ValCurs>` daily sheet into one rate per `<Valute>`, stamped
/// with midnight UTC of the current day.
pub fn xml_dec(body: &[u8]) -> RateResult<Vec<Rate>> {
    xml_dec_at(body, midnight_utc(Utc::now()))
}

pub fn midnight_utc(now: DateTime<Utc>) -> i64 {
    now.date_naive().and_time(NaiveTime::MIN).and_utc().timestamp()
}

#[derive(Clone, Copy)]
enum ValuteField {
    CharCode,
    Nominal,
    Value,
}

// The sheet declares windows-1251; the reader decodes text per the prolog's
// charset, so field bytes must go through `Reader::decoder`.
fn xml_dec_at(body: &[u8], time: i64) -> RateResult<Vec<Rate>> {
    let mut reader = Reader::from_reader(body);
    reader.config_mut().trim_text(true);

    let mut rates = Vec::new();
    let mut current: Option<Rate> = None;
    let mut field: Option<ValuteField> = None;
    let mut buf = Vec::new();

    loop {
        match reader.read_event_into(&mut buf) {
            Err(e) => return Err(RateError::Decode(format!("xml: {e}"))),
            Ok(Event::Eof) => break,
            Ok(Event::Start(start)) => match start.name().as_ref() {
                b"Valute" => {
                    current = Some(Rate {
                        id: 0,
                        char_code: String::new(),
                        nominal: 0,
                        time,
                        value: 0.0,
                    });
                }
                b"CharCode" => field = Some(ValuteField::CharCode),
                b"Nominal" => field = Some(ValuteField::Nominal),
                b"Value" => field = Some(ValuteField::Value),
                _ => field = None,
            },
            Ok(Event::Text(text)) => {
                if let (Some(rate), Some(field)) = (current.as_mut(), field) {
                    let text = reader
                        .decoder()
                        .decode(text.as_ref())
                        .map_err(|e| RateError::Decode(format!("xml charset: {e}")))?;
                    match field {
                        ValuteField::CharCode => rate.char_code = text.trim().to_string(),
                        ValuteField::Nominal => rate.nominal = text.trim().parse()?,
                        ValuteField::Value => {
                            rate.value = text.trim().replace(',', ".").parse()?;
                        }
                    }
                }
            }
            Ok(Event::End(end)) => {
                if end.name().as_ref() == b"Valute" {
                    if let Some(rate) = current.take() {
                        rates.push(rate);
                    }
                }
                field = None;
            }
            Ok(_) => {}
        }
        buf.clear();
    }

    Ok(rates)
}

/// Decode stage: one `decode` call per input body. A failed body is reported
/// and the stage keeps reading; exhaustion of the input closes both outputs.
pub fn decode_stream<F>(
    mut input: mpsc::Receiver<Vec<u8>>,
    decode: F,
) -> (mpsc::Receiver<Vec<Rate>>, mpsc::Receiver<RateError>)
where
    F: Fn(&[u8]) -> RateResult<Vec<Rate>> + Send + 'static,
{
    let (out_tx, out_rx) = mpsc::channel(1);
    let (err_tx, err_rx) = mpsc::channel(2);

    tokio::spawn(async move {
        while let Some(body) = input.recv().await {
            match decode(&body) {
                Ok(rates) => {
                    if out_tx.send(rates).await.is_err() {
                        break;
                    }
                }
                Err(e) => {
                    let _ = err_tx.send(e).await;
                }
            }
        }
    });

    (out_rx, err_rx)
}

#[cfg(test)]
mod tests {
    use super::*;

    const BTC_BODY: &[u8] =
        br#"{"code":"200000","data":{"time":1658237004004,"symbol":"BTC-USDT","buy":"22278.80"}}"#;

    #[test]
    fn json_dec_truncates_milliseconds() {
        let rates = json_dec(BTC_BODY).expect("decode");
        assert_eq!(rates.len(), 1);
        let rate = &rates[0];
        assert_eq!(rate.time, 1658237004, "time must be body.data.time / 1000");
        assert_eq!(rate.value, 22278.80);
        assert_eq!(rate.nominal, 0, "BTC stays out of the fiat cross-rate loop");
        assert!(rate.char_code.is_empty());
    }

    #[test]
    fn json_dec_rejects_garbage() {
        assert!(json_dec(b"not json").is_err());
        assert!(json_dec(br#"{"data":{"time":1,"buy":"abc"}}"#).is_err());
    }

    #[test]
    fn xml_dec_normalises_nominal_and_time() {
        let body = br#"<?xml version="1.0" encoding="UTF-8"?>
<ValCurs Date="19.07.2022" name="Foreign Currency Market">
  <Valute ID="R01010">
    <NumCode>036</NumCode>
    <CharCode>AUD</CharCode>
    <Nominal>1</Nominal>
    <Name>Australian dollar</Name>
    <Value>37,9799</Value>
  </Valute>
</ValCurs>"#;
        let rates = xml_dec_at(body, 1658188800).expect("decode");
        assert_eq!(rates.len(), 1);
        assert_eq!(
            rates[0],
            Rate {
                id: 0,
                char_code: "AUD".to_string(),
                nominal: 1,
                time: 1658188800,
                value: 37.9799,
            }
        );
    }

    #[test]
    fn xml_dec_same_time_for_whole_batch() {
        let body = br#"<?xml version="1.0" encoding="UTF-8"?>
<ValCurs>
  <Valute><CharCode>USD</CharCode><Nominal>1</Nominal><Value>56,4783</Value></Valute>
  <Valute><CharCode>HUF</CharCode><Nominal>100</Nominal><Value>14,3324</Value></Valute>
  <Valute><CharCode>GBP</CharCode><Nominal>1</Nominal><Value>67,7627</Value></Valute>
</ValCurs>"#;
        let rates = xml_dec_at(body, 1658188800).expect("decode");
        assert_eq!(rates.len(), 3);
        assert!(rates.iter().all(|r| r.time == 1658188800));
        assert_eq!(rates[1].char_code, "HUF");
        assert_eq!(rates[1].nominal, 100);
        assert_eq!(rates[1].value, 14.3324);
    }

    #[test]
    fn xml_dec_honours_declared_charset() {
        // windows-1251 body: <Name> holds 0xC4 0xEE 0xEB 0xEB 0xE0 0xF0 ("Доллар"),
        // which is invalid UTF-8 and must be decoded per the prolog.
        let mut body = Vec::new();
        body.extend_from_slice(b"<?xml version=\"1.0\" encoding=\"windows-1251\"?>");
        body.extend_from_slice(b"<ValCurs><Valute><CharCode>USD</CharCode><Nominal>1</Nominal><Name>");
        body.extend_from_slice(&[0xC4, 0xEE, 0xEB, 0xEB, 0xE0, 0xF0]);
        body.extend_from_slice(b"</Name><Value>56,4783</Value></Valute></ValCurs>");

        let rates = xml_dec_at(&body, 0).expect("decode");
        assert_eq!(rates.len(), 1);
        assert_eq!(rates[0].char_code, "USD");
        assert_eq!(rates[0].value, 56.4783);
    }

    #[tokio::test]
    async fn decode_stream_reports_bad_bodies_and_keeps_going() {
        let (body_tx, body_rx) = mpsc::channel(4);
        let (mut rates, mut errs) = decode_stream(body_rx, json_dec);

        body_tx.send(b"garbage".to_vec()).await.expect("send");
        body_tx.send(BTC_BODY.to_vec()).await.expect("send");
        drop(body_tx);

        let err = errs.recv().await.expect("one decode error");
        assert!(matches!(err, RateError::Decode(_)));

        let batch = rates.recv().await.expect("one good batch");
        assert_eq!(batch[0].value, 22278.80);

        assert!(rates.recv().await.is_none(), "rates channel must close");
        assert!(errs.recv().await.is_none(), "error channel must close");
    }
}
