use bytes::{Buf, BufMut, BytesMut};

use metricdb_utils::hash::hash_tags;

/// separator joining namespace and metric name in composite keys
const NAME_SEPARATOR: char = '|';

const SIMPLE_FIELD_DELTA_SUM_FLAG: u8 = 0x01;
const SIMPLE_FIELD_GAUGE_FLAG: u8 = 0x02;
const SIMPLE_FIELD_MIN_FLAG: u8 = 0x03;
const SIMPLE_FIELD_MAX_FLAG: u8 = 0x04;

/// sanitize_namespace replaces the reserved separator in a namespace.
pub fn sanitize_namespace(namespace: &str) -> String {
    namespace.replace(NAME_SEPARATOR, "_")
}

/// sanitize_metric_name replaces the reserved separator in a metric name.
pub fn sanitize_metric_name(metric_name: &str) -> String {
    metric_name.replace(NAME_SEPARATOR, "_")
}

/// join_namespace_metric builds the composite key of a pre-sanitised pair.
pub fn join_namespace_metric(namespace: &str, metric_name: &str) -> String {
    let mut s = String::with_capacity(namespace.len() + 1 + metric_name.len());
    s.push_str(namespace);
    s.push(NAME_SEPARATOR);
    s.push_str(metric_name);
    s
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SimpleFieldType {
    DeltaSum,
    Gauge,
    Min,
    Max,
}

impl SimpleFieldType {
    pub fn flag(&self) -> u8 {
        match self {
            Self::DeltaSum => SIMPLE_FIELD_DELTA_SUM_FLAG,
            Self::Gauge => SIMPLE_FIELD_GAUGE_FLAG,
            Self::Min => SIMPLE_FIELD_MIN_FLAG,
            Self::Max => SIMPLE_FIELD_MAX_FLAG,
        }
    }

    pub fn from_flag(flag: u8) -> anyhow::Result<Self> {
        match flag {
            SIMPLE_FIELD_DELTA_SUM_FLAG => Ok(Self::DeltaSum),
            SIMPLE_FIELD_GAUGE_FLAG => Ok(Self::Gauge),
            SIMPLE_FIELD_MIN_FLAG => Ok(Self::Min),
            SIMPLE_FIELD_MAX_FLAG => Ok(Self::Max),
            _ => Err(anyhow!("unknown simple field type flag: {}", flag)),
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct KeyValue {
    pub key: String,
    pub value: String,
}

impl KeyValue {
    pub fn new(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct SimpleField {
    pub name: String,
    pub field_type: SimpleFieldType,
    pub value: f64,
}

/// MetricRecord is the logical write record: one metric, one timestamp,
/// a tag set and a list of simple fields.
#[derive(Clone, Debug, PartialEq)]
pub struct MetricRecord {
    pub namespace: String,
    pub name: String,
    /// unix timestamp in milliseconds
    pub timestamp: i64,
    pub tags: Vec<KeyValue>,
    pub simple_fields: Vec<SimpleField>,
}

impl MetricRecord {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>, timestamp: i64) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
            timestamp,
            tags: Vec::new(),
            simple_fields: Vec::new(),
        }
    }

    /// tags_hash returns the canonical hash identifying this record's series
    /// within its metric. Tag order in the record does not matter.
    pub fn tags_hash(&self) -> u64 {
        let pairs: Vec<(&str, &str)> = self
            .tags
            .iter()
            .map(|kv| (kv.key.as_str(), kv.value.as_str()))
            .collect();
        hash_tags(&pairs)
    }

    pub fn encode(&self) -> anyhow::Result<BytesMut> {
        let mut buf = BytesMut::with_capacity(64);
        write_str(&mut buf, &self.namespace)?;
        write_str(&mut buf, &self.name)?;
        buf.put_i64(self.timestamp);

        if self.tags.len() > u16::MAX as usize {
            return Err(anyhow!("too many tags: {}", self.tags.len()));
        }
        buf.put_u16(self.tags.len() as u16);
        for kv in &self.tags {
            write_str(&mut buf, &kv.key)?;
            write_str(&mut buf, &kv.value)?;
        }

        self.encode_fields_to(&mut buf)?;
        Ok(buf)
    }

    /// encode_fields returns only the simple-field section, the payload
    /// stored per data point.
    pub fn encode_fields(&self) -> anyhow::Result<BytesMut> {
        let mut buf = BytesMut::with_capacity(16);
        self.encode_fields_to(&mut buf)?;
        Ok(buf)
    }

    fn encode_fields_to(&self, buf: &mut BytesMut) -> anyhow::Result<()> {
        if self.simple_fields.len() > u16::MAX as usize {
            return Err(anyhow!("too many fields: {}", self.simple_fields.len()));
        }
        buf.put_u16(self.simple_fields.len() as u16);
        for field in &self.simple_fields {
            write_str(buf, &field.name)?;
            buf.put_u8(field.field_type.flag());
            buf.put_f64(field.value);
        }
        Ok(())
    }

    pub fn decode(buf: &mut impl Buf) -> anyhow::Result<Self> {
        let namespace = read_str(buf)?;
        let name = read_str(buf)?;

        if buf.remaining() < 8 + 2 {
            return Err(anyhow!("not enough data for metric record"));
        }
        let timestamp = buf.get_i64();

        let tag_count = buf.get_u16() as usize;
        let mut tags = Vec::with_capacity(tag_count);
        for _ in 0..tag_count {
            let key = read_str(buf)?;
            let value = read_str(buf)?;
            tags.push(KeyValue { key, value });
        }

        let simple_fields = Self::decode_fields(buf)?;

        Ok(Self {
            namespace,
            name,
            timestamp,
            tags,
            simple_fields,
        })
    }

    pub fn decode_fields(buf: &mut impl Buf) -> anyhow::Result<Vec<SimpleField>> {
        if buf.remaining() < 2 {
            return Err(anyhow!("not enough data for simple fields"));
        }
        let field_count = buf.get_u16() as usize;
        let mut fields = Vec::with_capacity(field_count);
        for _ in 0..field_count {
            let name = read_str(buf)?;
            if buf.remaining() < 1 + 8 {
                return Err(anyhow!("not enough data for simple field"));
            }
            let field_type = SimpleFieldType::from_flag(buf.get_u8())?;
            let value = buf.get_f64();
            fields.push(SimpleField {
                name,
                field_type,
                value,
            });
        }
        Ok(fields)
    }
}

fn write_str(buf: &mut BytesMut, s: &str) -> anyhow::Result<()> {
    if s.len() > u16::MAX as usize {
        return Err(anyhow!("string too long: {} bytes", s.len()));
    }
    buf.put_u16(s.len() as u16);
    buf.put_slice(s.as_bytes());
    Ok(())
}

fn read_str(buf: &mut impl Buf) -> anyhow::Result<String> {
    if buf.remaining() < 2 {
        return Err(anyhow!("not enough data for string length"));
    }
    let len = buf.get_u16() as usize;
    if buf.remaining() < len {
        return Err(anyhow!("not enough data for string"));
    }
    let mut bytes = vec![0_u8; len];
    buf.copy_to_slice(&mut bytes);
    Ok(String::from_utf8(bytes)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sanitize() {
        assert_eq!("aaaa", sanitize_namespace("aaaa"));
        assert_eq!("aa_aa", sanitize_namespace("aa|aa"));

        assert_eq!("aaaa", sanitize_metric_name("aaaa"));
        assert_eq!("aa_aa", sanitize_metric_name("aa|aa"));

        assert_eq!("aa|bb", join_namespace_metric("aa", "bb"));
    }

    fn build_record() -> MetricRecord {
        let mut record = MetricRecord::new("default-ns", "hello", 1567624248000);
        for i in 0..10 {
            record
                .tags
                .push(KeyValue::new(format!("key{}", i), format!("value{}", i)));
            record.simple_fields.push(SimpleField {
                name: format!("counter{}", i),
                field_type: SimpleFieldType::DeltaSum,
                value: i as f64,
            });
        }
        record
    }

    #[test]
    fn test_record_round_trip() -> anyhow::Result<()> {
        let record = build_record();
        let buf = record.encode()?;

        let decoded = MetricRecord::decode(&mut buf.freeze())?;
        assert_eq!(record, decoded);
        assert_eq!(10, decoded.tags.len());
        assert_eq!(10, decoded.simple_fields.len());
        for i in 0..10 {
            assert_eq!(format!("key{}", i), decoded.tags[i].key);
            assert_eq!(format!("value{}", i), decoded.tags[i].value);
            assert_eq!(format!("counter{}", i), decoded.simple_fields[i].name);
            assert_eq!(SimpleFieldType::DeltaSum, decoded.simple_fields[i].field_type);
            assert_eq!(i as f64, decoded.simple_fields[i].value);
        }
        Ok(())
    }

    #[test]
    fn test_fields_round_trip() -> anyhow::Result<()> {
        let record = build_record();
        let buf = record.encode_fields()?;
        let fields = MetricRecord::decode_fields(&mut buf.freeze())?;
        assert_eq!(record.simple_fields, fields);
        Ok(())
    }

    #[test]
    fn test_decode_truncated() -> anyhow::Result<()> {
        let record = build_record();
        let buf = record.encode()?;

        // every strict prefix must fail, never panic
        for cut in 0..buf.len() {
            let mut partial = bytes::Bytes::copy_from_slice(&buf[..cut]);
            assert!(MetricRecord::decode(&mut partial).is_err(), "cut={}", cut);
        }
        Ok(())
    }

    #[test]
    fn test_tags_hash_order_insensitive() {
        let mut a = MetricRecord::new("ns", "m", 0);
        a.tags.push(KeyValue::new("host", "h-1"));
        a.tags.push(KeyValue::new("zone", "eu"));

        let mut b = MetricRecord::new("ns", "m", 0);
        b.tags.push(KeyValue::new("zone", "eu"));
        b.tags.push(KeyValue::new("host", "h-1"));

        assert_eq!(a.tags_hash(), b.tags_hash());
    }

    #[test]
    fn test_unknown_field_flag() {
        assert!(SimpleFieldType::from_flag(0x7f).is_err());
    }
}
