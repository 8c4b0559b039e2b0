//! Built-in roles used when the configuration lists none.

use crate::config::{RoleConfig, SchemaConfig};
use crate::model::{Attribute, AttributeType, MergeOperation};
use crate::worker::{PersistenceStrategy, SelectorKind};

fn attr(name: &str, ty: AttributeType, merge: MergeOperation) -> Attribute {
    Attribute::new(name, ty, merge)
}

fn role(
    name: &str,
    persistence: PersistenceStrategy,
    attributes: Vec<Attribute>,
) -> RoleConfig {
    RoleConfig {
        name: name.to_string(),
        pool_size: None,
        persistence,
        selector: Some(SelectorKind::HashCode),
        schema: SchemaConfig {
            name: None,
            version: 1,
            attributes,
        },
    }
}

/// Default stream roles: three merge-on-write metric streams and two
/// insert-only trace streams.
pub fn default_roles() -> Vec<RoleConfig> {
    use AttributeType::{Bool, Bytes, Int32, Int64, String};
    use MergeOperation::{Cover, Max, Min, Non, Sum};

    vec![
        // Per-minute call statistics of one service.
        role(
            "service_metric",
            PersistenceStrategy::MergeOnWrite,
            vec![
                attr("service_id", Int32, Non),
                attr("time_bucket", Int64, Non),
                attr("calls", Int64, Sum),
                attr("error_calls", Int64, Sum),
                attr("duration_sum", Int64, Sum),
                attr("error_duration_sum", Int64, Sum),
                attr("min_duration", Int64, Min),
                attr("max_duration", Int64, Max),
                attr("satisfied_count", Int64, Sum),
                attr("tolerating_count", Int64, Sum),
                attr("frustrated_count", Int64, Sum),
            ],
        ),
        role(
            "instance_heartbeat",
            PersistenceStrategy::MergeOnWrite,
            vec![
                attr("application_id", Int32, Non),
                attr("agent_uuid", String, Non),
                attr("register_time", Int64, Non),
                attr("heartbeat_time", Int64, Cover),
                attr("os_info", String, Cover),
                attr("is_address", Bool, Non),
            ],
        ),
        // JVM memory gauges, last sample in the bucket wins.
        role(
            "memory_metric",
            PersistenceStrategy::MergeOnWrite,
            vec![
                attr("instance_id", Int32, Non),
                attr("is_heap", Bool, Non),
                attr("init", Int64, Cover),
                attr("max", Int64, Cover),
                attr("used", Int64, Cover),
                attr("committed", Int64, Cover),
                attr("time_bucket", Int64, Non),
            ],
        ),
        role(
            "segment",
            PersistenceStrategy::InsertOnly,
            vec![
                attr("data_binary", Bytes, Cover),
                attr("time_bucket", Int64, Cover),
            ],
        ),
        role(
            "global_trace",
            PersistenceStrategy::InsertOnly,
            vec![
                attr("segment_id", String, Cover),
                attr("global_trace_id", String, Cover),
                attr("time_bucket", Int64, Cover),
            ],
        ),
    ]
}
