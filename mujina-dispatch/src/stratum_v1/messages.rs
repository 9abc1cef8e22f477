//! Stratum v1 message types and JSON-RPC serialization.
//!
//! Messages are JSON-RPC objects, one per line. Server notifications and
//! requests carry a method; responses carry only an id with a result or an
//! error.

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use super::error::{StratumError, StratumResult};

/// JSON-RPC message envelope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum JsonRpcMessage {
    /// Request or notification (null id) from either side
    Request {
        id: Option<u64>,
        method: String,
        #[serde(default)]
        params: Value,
    },

    /// Response to a request. Some pools answer unparseable requests with a
    /// null id.
    Response {
        id: Option<u64>,
        #[serde(default)]
        result: Value,
        #[serde(default)]
        error: Value,
    },
}

impl JsonRpcMessage {
    pub fn request(id: u64, method: impl Into<String>, params: Value) -> Self {
        JsonRpcMessage::Request {
            id: Some(id),
            method: method.into(),
            params,
        }
    }

    pub fn response(id: Option<u64>, result: Value) -> Self {
        JsonRpcMessage::Response {
            id,
            result,
            error: Value::Null,
        }
    }

    pub fn method(&self) -> Option<&str> {
        match self {
            JsonRpcMessage::Request { method, .. } => Some(method),
            JsonRpcMessage::Response { .. } => None,
        }
    }
}

/// What `mining.subscribe` told us.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Subscription {
    /// Id offered back on reconnect to resume the session.
    pub subscription_id: Option<String>,

    /// Extranonce1 (hex), also the session identity for resubmission.
    pub nonce1: String,

    pub n2size: usize,
}

impl Subscription {
    /// Parse `[[["mining.notify", id], ...], nonce1, n2size]`.
    ///
    /// Extranonce2 is carried in a u64, so sizes above 8 bytes are refused.
    pub fn from_result(result: &Value) -> StratumResult<Self> {
        let fields = result
            .as_array()
            .filter(|a| a.len() >= 3)
            .ok_or_else(|| StratumError::SubscriptionFailed(format!("bad result {result}")))?;

        let subscription_id = fields[0].as_array().and_then(|subs| {
            // Either a list of [method, id] pairs or a single pair.
            let pairs: Vec<&Value> = if subs.first().is_some_and(Value::is_array) {
                subs.iter().collect()
            } else {
                vec![&fields[0]]
            };
            pairs.into_iter().find_map(|pair| {
                let pair = pair.as_array()?;
                (pair.first()?.as_str()? == "mining.notify")
                    .then(|| pair.get(1)?.as_str().map(str::to_string))
                    .flatten()
            })
        });

        let nonce1 = fields[1]
            .as_str()
            .filter(|s| hex::decode(s).is_ok())
            .ok_or_else(|| StratumError::SubscriptionFailed("bad extranonce1".into()))?
            .to_string();
        let n2size = fields[2]
            .as_u64()
            .and_then(|n| usize::try_from(n).ok())
            .filter(|n| (1..=8).contains(n))
            .ok_or_else(|| {
                StratumError::SubscriptionFailed(format!("unsupported extranonce2 size {}", fields[2]))
            })?;

        Ok(Self {
            subscription_id,
            nonce1,
            n2size,
        })
    }
}

/// A parsed `mining.notify`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobNotification {
    pub job_id: String,

    /// Previous block hash, internal byte order.
    pub prev_hash: [u8; 32],

    pub coinbase1: Vec<u8>,
    pub coinbase2: Vec<u8>,
    pub merkle_branches: Vec<[u8; 32]>,
    pub version: u32,
    pub nbits: u32,
    pub ntime: u32,

    /// Abandon all previous jobs.
    pub clean_jobs: bool,
}

fn param_str<'a>(params: &'a [Value], idx: usize, name: &str) -> StratumResult<&'a str> {
    params
        .get(idx)
        .and_then(Value::as_str)
        .ok_or_else(|| StratumError::InvalidMessage(format!("mining.notify {name} not a string")))
}

fn param_u32(params: &[Value], idx: usize, name: &str) -> StratumResult<u32> {
    let s = param_str(params, idx, name)?;
    u32::from_str_radix(s, 16)
        .map_err(|e| StratumError::InvalidMessage(format!("mining.notify {name}: {e}")))
}

fn decode_hash(s: &str, name: &str) -> StratumResult<[u8; 32]> {
    let mut out = [0u8; 32];
    hex::decode_to_slice(s, &mut out)
        .map_err(|e| StratumError::InvalidMessage(format!("mining.notify {name}: {e}")))?;
    Ok(out)
}

impl JobNotification {
    pub fn from_stratum_params(params: &Value) -> StratumResult<Self> {
        let params = params
            .as_array()
            .filter(|p| p.len() >= 9)
            .ok_or_else(|| StratumError::InvalidMessage("mining.notify params too short".into()))?;

        // Stratum sends the previous hash as eight words, each byte-swapped.
        let mut prev_hash = decode_hash(param_str(params, 1, "prev_hash")?, "prev_hash")?;
        for word in prev_hash.chunks_mut(4) {
            word.reverse();
        }

        let coinbase1 = hex::decode(param_str(params, 2, "coinbase1")?)
            .map_err(|e| StratumError::InvalidMessage(format!("coinbase1: {e}")))?;
        let coinbase2 = hex::decode(param_str(params, 3, "coinbase2")?)
            .map_err(|e| StratumError::InvalidMessage(format!("coinbase2: {e}")))?;

        let merkle_branches = params[4]
            .as_array()
            .ok_or_else(|| StratumError::InvalidMessage("merkle_branches not an array".into()))?
            .iter()
            .map(|b| {
                let s = b.as_str().ok_or_else(|| {
                    StratumError::InvalidMessage("merkle branch not a string".into())
                })?;
                decode_hash(s, "merkle branch")
            })
            .collect::<StratumResult<Vec<_>>>()?;

        Ok(Self {
            job_id: param_str(params, 0, "job_id")?.to_string(),
            prev_hash,
            coinbase1,
            coinbase2,
            merkle_branches,
            version: param_u32(params, 5, "version")?,
            nbits: param_u32(params, 6, "nbits")?,
            ntime: param_u32(params, 7, "ntime")?,
            clean_jobs: params[8].as_bool().unwrap_or(false),
        })
    }
}

/// Parameters for `mining.submit`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubmitParams {
    pub username: String,
    pub job_id: String,
    pub extranonce2: Vec<u8>,

    /// ntime as it appears in the job, big-endian hex
    pub ntime: String,
    pub nonce: u32,

    /// Version bits rolled within the pool's mask
    pub version_bits: Option<u32>,
}

impl SubmitParams {
    pub fn to_stratum_json(&self) -> Value {
        let mut params = vec![
            json!(self.username),
            json!(self.job_id),
            json!(hex::encode(&self.extranonce2)),
            json!(self.ntime),
            json!(format!("{:08x}", self.nonce)),
        ];
        if let Some(bits) = self.version_bits {
            params.push(json!(format!("{bits:08x}")));
        }
        Value::Array(params)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_notification_and_response() {
        let notify: JsonRpcMessage = serde_json::from_str(
            r#"{"id":null,"method":"mining.set_difficulty","params":[512]}"#,
        )
        .unwrap();
        assert_eq!(notify.method(), Some("mining.set_difficulty"));

        let response: JsonRpcMessage =
            serde_json::from_str(r#"{"id":4,"result":true,"error":null}"#).unwrap();
        assert_eq!(
            response,
            JsonRpcMessage::Response {
                id: Some(4),
                result: Value::Bool(true),
                error: Value::Null,
            }
        );

        let rejected: JsonRpcMessage =
            serde_json::from_str(r#"{"id":5,"result":null,"error":[23,"low difficulty share",null]}"#)
                .unwrap();
        assert!(matches!(rejected, JsonRpcMessage::Response { id: Some(5), .. }));
    }

    #[test]
    fn test_subscription_result() {
        let result = json!([
            [["mining.set_difficulty", "b4b6693b72a50c7116db18d6497cac52"],
             ["mining.notify", "ae6812eb4cd7735a302a8a9dd95cf71f"]],
            "08000002",
            4
        ]);
        let sub = Subscription::from_result(&result).unwrap();
        assert_eq!(sub.subscription_id.as_deref(), Some("ae6812eb4cd7735a302a8a9dd95cf71f"));
        assert_eq!(sub.nonce1, "08000002");
        assert_eq!(sub.n2size, 4);

        let flat = json!([["mining.notify", "abc"], "ff", 8]);
        assert_eq!(Subscription::from_result(&flat).unwrap().subscription_id.as_deref(), Some("abc"));
    }

    #[test]
    fn test_subscription_rejects_oversized_nonce2() {
        let result = json!([[], "08000002", 16]);
        assert!(matches!(
            Subscription::from_result(&result),
            Err(StratumError::SubscriptionFailed(_))
        ));
    }

    #[test]
    fn test_job_notification_word_swaps_prev_hash() {
        let params = json!([
            "bf",
            "4d16b6f85af6e2198f44ae2a6de67f78487ae5611b77c6c0440b921e00000000",
            "01000000010000",
            "072f736c7573682f",
            ["0000000000000000000000000000000000000000000000000000000000000001"],
            "20000000",
            "1d00ffff",
            "504e86b9",
            true
        ]);
        let job = JobNotification::from_stratum_params(&params).unwrap();
        assert_eq!(job.job_id, "bf");
        assert_eq!(&job.prev_hash[..4], &[0xf8, 0xb6, 0x16, 0x4d]);
        assert_eq!(&job.prev_hash[28..], &[0, 0, 0, 0]);
        assert_eq!(job.version, 0x2000_0000);
        assert_eq!(job.nbits, 0x1d00ffff);
        assert_eq!(job.ntime, 0x504e86b9);
        assert_eq!(job.merkle_branches[0][31], 1);
        assert!(job.clean_jobs);
    }

    #[test]
    fn test_job_notification_too_short() {
        let params = json!(["bf", "00"]);
        assert!(JobNotification::from_stratum_params(&params).is_err());
    }

    #[test]
    fn test_submit_params() {
        let params = SubmitParams {
            username: "worker".into(),
            job_id: "bf".into(),
            extranonce2: vec![0x01, 0x00, 0x00, 0x00],
            ntime: "504e86ed".into(),
            nonce: 0xb2957c02,
            version_bits: None,
        };
        assert_eq!(
            params.to_stratum_json(),
            json!(["worker", "bf", "01000000", "504e86ed", "b2957c02"])
        );
    }
}
