//! Checks that a success response carries the result type a caller expects.

use std::sync::{Arc, RwLock};

use serde::de::DeserializeOwned;

use crate::bridge::commands::RESULT_KIND;
use crate::bridge::protocol::SuccessResponse;
use crate::error::BridgeError;

type FailureCallback = Arc<dyn Fn(&SuccessResponse, &[&str]) + Send + Sync>;

/// Validates success payload types and notifies listeners on mismatch.
#[derive(Default)]
pub struct ResponseVerifier {
    callbacks: RwLock<Vec<FailureCallback>>,
}

impl ResponseVerifier {
    pub fn new() -> Self {
        Self::default()
    }

    /// Called with the offending response and the expected types on every failed check.
    pub fn on_verify_failure<F>(&self, callback: F)
    where
        F: Fn(&SuccessResponse, &[&str]) + Send + Sync + 'static,
    {
        match self.callbacks.write() {
            Ok(mut callbacks) => callbacks.push(Arc::new(callback)),
            Err(poisoned) => poisoned.into_inner().push(Arc::new(callback)),
        }
    }

    /// Return the response value if its type is one of `expected`.
    pub fn verify<'a>(
        &self,
        response: &'a SuccessResponse,
        expected: &[&str],
    ) -> Result<&'a serde_json::Value, BridgeError> {
        if expected.contains(&response.kind()) {
            return Ok(response.value());
        }

        tracing::warn!(
            uid = %response.uid,
            actual = response.kind(),
            ?expected,
            "Unexpected response type"
        );

        let callbacks: Vec<FailureCallback> = match self.callbacks.read() {
            Ok(callbacks) => callbacks.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        };
        for callback in callbacks {
            callback(response, expected);
        }

        Err(BridgeError::UnexpectedResultType {
            actual: response.kind().to_string(),
            expected: expected.iter().map(|s| s.to_string()).collect(),
        })
    }

    /// `verify` with the plain `"result"` type.
    pub fn verify_result<'a>(
        &self,
        response: &'a SuccessResponse,
    ) -> Result<&'a serde_json::Value, BridgeError> {
        self.verify(response, &[RESULT_KIND])
    }

    /// Verify the type, then decode the value.
    pub fn verify_as<T: DeserializeOwned>(
        &self,
        response: &SuccessResponse,
        expected: &[&str],
    ) -> Result<T, BridgeError> {
        self.verify(response, expected)?;
        response.value_as()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::commands::EvaluateResult;
    use crate::bridge::protocol::{RequestId, SuccessPayload};
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn response(kind: &str, value: serde_json::Value) -> SuccessResponse {
        SuccessResponse {
            uid: RequestId::from("r1"),
            payload: SuccessPayload {
                kind: kind.to_string(),
                value,
            },
        }
    }

    #[test]
    fn matching_type_passes_value_through() {
        let verifier = ResponseVerifier::new();
        let resp = response("result", json!({"evaluated_expression": "2"}));

        assert_eq!(
            verifier.verify_result(&resp).unwrap(),
            &json!({"evaluated_expression": "2"})
        );
    }

    #[test]
    fn mismatch_notifies_every_callback() {
        let verifier = ResponseVerifier::new();
        let calls = Arc::new(AtomicUsize::new(0));
        for _ in 0..2 {
            let calls = Arc::clone(&calls);
            verifier.on_verify_failure(move |resp, expected| {
                assert_eq!(resp.kind(), "plot");
                assert_eq!(expected, ["result"]);
                calls.fetch_add(1, Ordering::SeqCst);
            });
        }

        let err = verifier
            .verify_result(&response("plot", json!({})))
            .unwrap_err();

        assert_eq!(
            err,
            BridgeError::UnexpectedResultType {
                actual: "plot".to_string(),
                expected: vec!["result".to_string()],
            }
        );
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn verify_as_decodes_typed_result() {
        let verifier = ResponseVerifier::new();
        let resp = response(
            "result",
            json!({"evaluated_expression": "2", "metadata": {"separator": "="}}),
        );

        let result: EvaluateResult = verifier.verify_as(&resp, &["result"]).unwrap();
        assert_eq!(result.evaluated_expression, "2");
        assert_eq!(result.metadata.separator, "=");
    }

    #[test]
    fn verify_as_reports_decode_failure() {
        let verifier = ResponseVerifier::new();
        let resp = response("result", json!({"code": "x"}));

        let err = verifier
            .verify_as::<EvaluateResult>(&resp, &["result"])
            .unwrap_err();
        assert!(matches!(err, BridgeError::Decode(_)));
    }
}
