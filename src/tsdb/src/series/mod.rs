pub mod metric;

pub use metric::{
    join_namespace_metric, sanitize_metric_name, sanitize_namespace, KeyValue, MetricRecord,
    SimpleField, SimpleFieldType,
};

/// Series ID reserved for metrics written without any tags.
pub const SERIES_ID_WITHOUT_TAGS: u32 = 0;
