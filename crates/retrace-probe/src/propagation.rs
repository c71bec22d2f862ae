//! Cross-process propagation of the correlation triple
//!
//! A caller attaches `"<traceId>,<sessionId>,<eoi>,<ess>"` to its outbound
//! request (typically as a transport header) and reads the callee's final
//! counters back from the response. `"null"` fields mark absent values and
//! decode to the unset sentinels instead of raising an error.

use retrace_core::error::PropagationError;
use retrace_core::event::{NO_SESSION_ID, UNSET_EOI, UNSET_ESS, UNSET_TRACE_ID};
use serde::{Deserialize, Serialize};

/// Field value marking an absent entry in the wire tuple
pub const NULL_FIELD: &str = "null";

/// The propagated `(traceId, sessionId, eoi, ess)` snapshot
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CorrelationContext {
    pub trace_id: i64,
    pub session_id: String,
    /// eoi of the most recent call on the exporting side
    pub eoi: i32,
    /// depth the importing side continues at
    pub ess: i32,
}

impl CorrelationContext {
    /// Encode as the compact wire tuple
    pub fn to_header(&self) -> String {
        format!(
            "{},{},{},{}",
            self.trace_id, self.session_id, self.eoi, self.ess
        )
    }

    /// Decode the wire tuple, mapping `"null"` fields to the unset sentinels
    pub fn from_header(header: &str) -> Result<Self, PropagationError> {
        let fields: Vec<&str> = header.split(',').collect();
        if fields.len() != 4 {
            return Err(PropagationError::FieldCount(fields.len()));
        }

        let trace_id = if fields[0] == NULL_FIELD {
            UNSET_TRACE_ID
        } else {
            fields[0]
                .parse::<i64>()
                .map_err(|_| PropagationError::InvalidField {
                    field: "traceId",
                    value: fields[0].to_string(),
                })?
        };

        let session_id = if fields[1] == NULL_FIELD {
            NO_SESSION_ID.to_string()
        } else {
            fields[1].to_string()
        };

        let eoi = parse_counter(fields[2], "eoi", UNSET_EOI)?;
        let ess = parse_counter(fields[3], "ess", UNSET_ESS)?;

        Ok(Self {
            trace_id,
            session_id,
            eoi,
            ess,
        })
    }
}

fn parse_counter(raw: &str, field: &'static str, unset: i32) -> Result<i32, PropagationError> {
    if raw == NULL_FIELD {
        return Ok(unset);
    }
    raw.parse::<i32>().map_err(|_| PropagationError::InvalidField {
        field,
        value: raw.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_round_trip() {
        let ctx = CorrelationContext {
            trace_id: 62298,
            session_id: "ZU1GHGKPDCFIAKJ5".to_string(),
            eoi: 3,
            ess: 2,
        };
        let header = ctx.to_header();
        assert_eq!(header, "62298,ZU1GHGKPDCFIAKJ5,3,2");
        assert_eq!(CorrelationContext::from_header(&header).unwrap(), ctx);
    }

    #[test]
    fn null_fields_decode_to_sentinels() {
        let ctx = CorrelationContext::from_header("null,null,null,null").unwrap();
        assert_eq!(ctx.trace_id, UNSET_TRACE_ID);
        assert_eq!(ctx.session_id, NO_SESSION_ID);
        assert_eq!(ctx.eoi, UNSET_EOI);
        assert_eq!(ctx.ess, UNSET_ESS);
    }

    #[test]
    fn wrong_field_count_is_rejected() {
        assert_eq!(
            CorrelationContext::from_header("1,sess,0"),
            Err(PropagationError::FieldCount(3))
        );
    }

    #[test]
    fn garbage_counter_is_rejected() {
        let err = CorrelationContext::from_header("1,sess,x,0").unwrap_err();
        assert_eq!(
            err,
            PropagationError::InvalidField {
                field: "eoi",
                value: "x".to_string()
            }
        );
    }
}
