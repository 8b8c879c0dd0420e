//! Topic names for twin and method traffic.
//!
//! Requests carry their correlation id in a `$rid` query parameter and
//! responses echo it back, along with a status segment and, for twin
//! operations, the resulting `$version`.

use crate::correlation::CorrelationId;
use crate::method::MethodTarget;

pub const TWIN_RESPONSE_FILTER: &str = "$iothub/twin/res/#";
pub const DESIRED_PATCH_FILTER: &str = "$iothub/twin/PATCH/properties/desired/#";
pub const METHOD_REQUEST_FILTER: &str = "$iothub/methods/POST/#";
pub const INVOKE_RESPONSE_FILTER: &str = "$iothub/methods/invoke/res/#";

const TWIN_PREFIX: &str = "$iothub/twin/";
const METHODS_PREFIX: &str = "$iothub/methods/";
const RID: &str = "$rid";
const VERSION: &str = "$version";

#[must_use]
pub fn twin_get(request_id: CorrelationId) -> String {
    format!("$iothub/twin/GET/?$rid={request_id}")
}

#[must_use]
pub fn reported_patch(request_id: CorrelationId) -> String {
    format!("$iothub/twin/PATCH/properties/reported/?$rid={request_id}")
}

#[must_use]
pub fn twin_response(status: u16, request_id: CorrelationId, version: Option<u64>) -> String {
    match version {
        Some(version) => format!("$iothub/twin/res/{status}/?$rid={request_id}&$version={version}"),
        None => format!("$iothub/twin/res/{status}/?$rid={request_id}"),
    }
}

#[must_use]
pub fn desired_patch(version: u64) -> String {
    format!("$iothub/twin/PATCH/properties/desired/?$version={version}")
}

#[must_use]
pub fn method_request(method_name: &str, request_id: &str) -> String {
    format!("$iothub/methods/POST/{method_name}/?$rid={request_id}")
}

#[must_use]
pub fn method_response(status: i32, request_id: &str) -> String {
    format!("$iothub/methods/res/{status}/?$rid={request_id}")
}

#[must_use]
pub fn invoke(target: &MethodTarget, request_id: CorrelationId) -> String {
    match target {
        MethodTarget::Device { device_id } => {
            format!("$iothub/methods/invoke/{device_id}/?$rid={request_id}")
        }
        MethodTarget::Module {
            device_id,
            module_id,
        } => format!("$iothub/methods/invoke/{device_id}/modules/{module_id}/?$rid={request_id}"),
    }
}

#[must_use]
pub fn invoke_response(status: u16, request_id: CorrelationId) -> String {
    format!("$iothub/methods/invoke/res/{status}/?$rid={request_id}")
}

#[must_use]
pub fn telemetry(device_id: &str, module_id: Option<&str>) -> String {
    match module_id {
        Some(module_id) => format!("devices/{device_id}/modules/{module_id}/messages/events/"),
        None => format!("devices/{device_id}/messages/events/"),
    }
}

/// Matches a topic against a filter with `+` and trailing `#` wildcards.
#[must_use]
pub fn topic_matches_filter(topic: &str, filter: &str) -> bool {
    let mut topic_levels = topic.split('/');
    let mut filter_levels = filter.split('/');

    loop {
        match (filter_levels.next(), topic_levels.next()) {
            (Some("#"), _) => return true,
            (Some("+"), Some(_)) => {}
            (Some(f), Some(t)) if f == t => {}
            (None, None) => return true,
            _ => return false,
        }
    }
}

fn split_query(topic: &str) -> (&str, Vec<(&str, &str)>) {
    let (path, query) = match topic.split_once("/?") {
        Some((path, query)) => (path, query),
        None => (topic.trim_end_matches('/'), ""),
    };
    let params = query
        .split('&')
        .filter(|pair| !pair.is_empty())
        .map(|pair| pair.split_once('=').unwrap_or((pair, "")))
        .collect();
    (path, params)
}

fn param<'a>(params: &[(&'a str, &'a str)], name: &str) -> Option<&'a str> {
    params.iter().find(|(k, _)| *k == name).map(|(_, v)| *v)
}

/// Messages a device or service session receives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InboundMessage {
    TwinResponse {
        request_id: CorrelationId,
        status: u16,
        version: Option<u64>,
    },
    DesiredPatch {
        version: Option<u64>,
    },
    MethodRequest {
        method_name: String,
        request_id: String,
    },
    InvokeResponse {
        request_id: CorrelationId,
        status: u16,
    },
    Unknown,
}

impl InboundMessage {
    #[must_use]
    pub fn parse(topic: &str) -> Self {
        let (path, params) = split_query(topic);

        if let Some(rest) = path.strip_prefix(TWIN_PREFIX) {
            if let Some(status) = rest.strip_prefix("res/") {
                return Self::correlated(&params, status, |request_id, status| {
                    Self::TwinResponse {
                        request_id,
                        status,
                        version: param(&params, VERSION).and_then(|v| v.parse().ok()),
                    }
                });
            }
            if rest == "PATCH/properties/desired" {
                return Self::DesiredPatch {
                    version: param(&params, VERSION).and_then(|v| v.parse().ok()),
                };
            }
            return Self::Unknown;
        }

        if let Some(rest) = path.strip_prefix(METHODS_PREFIX) {
            if let Some(status) = rest.strip_prefix("invoke/res/") {
                return Self::correlated(&params, status, |request_id, status| {
                    Self::InvokeResponse { request_id, status }
                });
            }
            if let Some(method_name) = rest.strip_prefix("POST/") {
                if let (false, Some(request_id)) = (method_name.is_empty(), param(&params, RID)) {
                    return Self::MethodRequest {
                        method_name: method_name.to_string(),
                        request_id: request_id.to_string(),
                    };
                }
            }
        }

        Self::Unknown
    }

    fn correlated(
        params: &[(&str, &str)],
        status: &str,
        build: impl FnOnce(CorrelationId, u16) -> Self,
    ) -> Self {
        let request_id = param(params, RID).and_then(CorrelationId::parse);
        let status = status.parse::<u16>().ok();
        match (request_id, status) {
            (Some(request_id), Some(status)) => build(request_id, status),
            _ => Self::Unknown,
        }
    }
}

/// Requests a hub receives from connected sessions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutboundRequest {
    TwinGet {
        request_id: CorrelationId,
    },
    ReportedPatch {
        request_id: CorrelationId,
    },
    MethodResponse {
        request_id: String,
        status: i32,
    },
    Invoke {
        request_id: CorrelationId,
        target: MethodTarget,
    },
    Telemetry {
        device_id: String,
        module_id: Option<String>,
    },
}

impl OutboundRequest {
    #[must_use]
    pub fn parse(topic: &str) -> Option<Self> {
        let (path, params) = split_query(topic);
        let rid = || param(&params, RID).and_then(CorrelationId::parse);

        match path {
            "$iothub/twin/GET" => return rid().map(|request_id| Self::TwinGet { request_id }),
            "$iothub/twin/PATCH/properties/reported" => {
                return rid().map(|request_id| Self::ReportedPatch { request_id });
            }
            _ => {}
        }

        if let Some(status) = path.strip_prefix("$iothub/methods/res/") {
            return Some(Self::MethodResponse {
                request_id: param(&params, RID)?.to_string(),
                status: status.parse().ok()?,
            });
        }

        if let Some(target) = path.strip_prefix("$iothub/methods/invoke/") {
            let target = match target.split('/').collect::<Vec<_>>().as_slice() {
                [device_id] => MethodTarget::device(*device_id),
                [device_id, "modules", module_id] => MethodTarget::module(*device_id, *module_id),
                _ => return None,
            };
            return rid().map(|request_id| Self::Invoke { request_id, target });
        }

        match path.split('/').collect::<Vec<_>>().as_slice() {
            ["devices", device_id, "messages", "events"] => Some(Self::Telemetry {
                device_id: (*device_id).to_string(),
                module_id: None,
            }),
            ["devices", device_id, "modules", module_id, "messages", "events"] => {
                Some(Self::Telemetry {
                    device_id: (*device_id).to_string(),
                    module_id: Some((*module_id).to_string()),
                })
            }
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rid(raw: u64) -> CorrelationId {
        CorrelationId::from_raw(raw)
    }

    #[test]
    fn test_parse_twin_response() {
        let topic = twin_response(204, rid(7), Some(12));
        assert_eq!(
            InboundMessage::parse(&topic),
            InboundMessage::TwinResponse {
                request_id: rid(7),
                status: 204,
                version: Some(12),
            }
        );

        assert_eq!(
            InboundMessage::parse("$iothub/twin/res/200/?$rid=3"),
            InboundMessage::TwinResponse {
                request_id: rid(3),
                status: 200,
                version: None,
            }
        );
    }

    #[test]
    fn test_parse_desired_patch() {
        assert_eq!(
            InboundMessage::parse(&desired_patch(9)),
            InboundMessage::DesiredPatch { version: Some(9) }
        );
    }

    #[test]
    fn test_parse_method_request() {
        assert_eq!(
            InboundMessage::parse(&method_request("reset", "abc")),
            InboundMessage::MethodRequest {
                method_name: "reset".to_string(),
                request_id: "abc".to_string(),
            }
        );
        assert_eq!(
            InboundMessage::parse("$iothub/methods/POST//?$rid=1"),
            InboundMessage::Unknown
        );
    }

    #[test]
    fn test_parse_invoke_response() {
        assert_eq!(
            InboundMessage::parse(&invoke_response(404, rid(5))),
            InboundMessage::InvokeResponse {
                request_id: rid(5),
                status: 404,
            }
        );
        assert_eq!(
            InboundMessage::parse("$iothub/methods/invoke/res/oops/?$rid=5"),
            InboundMessage::Unknown
        );
    }

    #[test]
    fn test_unrelated_topic_is_unknown() {
        assert_eq!(
            InboundMessage::parse("devices/d/messages/devicebound/"),
            InboundMessage::Unknown
        );
    }

    #[test]
    fn test_parse_outbound_requests() {
        assert_eq!(
            OutboundRequest::parse(&twin_get(rid(1))),
            Some(OutboundRequest::TwinGet { request_id: rid(1) })
        );
        assert_eq!(
            OutboundRequest::parse(&reported_patch(rid(2))),
            Some(OutboundRequest::ReportedPatch { request_id: rid(2) })
        );
        assert_eq!(
            OutboundRequest::parse(&method_response(403, "x1")),
            Some(OutboundRequest::MethodResponse {
                request_id: "x1".to_string(),
                status: 403,
            })
        );
        assert_eq!(
            OutboundRequest::parse(&invoke(&MethodTarget::module("d", "m"), rid(4))),
            Some(OutboundRequest::Invoke {
                request_id: rid(4),
                target: MethodTarget::module("d", "m"),
            })
        );
        assert_eq!(
            OutboundRequest::parse(&telemetry("d", None)),
            Some(OutboundRequest::Telemetry {
                device_id: "d".to_string(),
                module_id: None,
            })
        );
    }

    #[test]
    fn test_filters_match_their_topics() {
        assert!(topic_matches_filter(&twin_response(200, rid(1), None), TWIN_RESPONSE_FILTER));
        assert!(topic_matches_filter(&desired_patch(1), DESIRED_PATCH_FILTER));
        assert!(topic_matches_filter(&method_request("m", "1"), METHOD_REQUEST_FILTER));
        assert!(topic_matches_filter(&invoke_response(200, rid(1)), INVOKE_RESPONSE_FILTER));
        assert!(!topic_matches_filter(&desired_patch(1), TWIN_RESPONSE_FILTER));
        assert!(topic_matches_filter("a/b/c", "a/+/c"));
        assert!(!topic_matches_filter("a/b", "a/b/c"));
    }
}
