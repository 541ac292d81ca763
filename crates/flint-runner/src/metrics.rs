use serde_json::{json, Map, Value};
use std::collections::BTreeMap;

/// Named series of values collected while a skeleton runs.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MetricLog {
    series: BTreeMap<String, Vec<f64>>,
}

impl MetricLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&mut self, name: impl Into<String>, value: f64) {
        self.series.entry(name.into()).or_default().push(value);
    }

    pub fn all(&self, name: &str) -> &[f64] {
        self.series.get(name).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn last(&self, name: &str) -> Option<f64> {
        self.all(name).last().copied()
    }

    pub fn average(&self, name: &str) -> Option<f64> {
        let values = self.all(name);
        if values.is_empty() {
            None
        } else {
            Some(values.iter().sum::<f64>() / values.len() as f64)
        }
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.series.keys().map(String::as_str)
    }

    pub fn is_empty(&self) -> bool {
        self.series.is_empty()
    }

    /// `{"<name>": average, "<name>_data": [values...]}` for every series.
    pub fn summary(&self) -> Value {
        let mut out = Map::new();
        for (name, values) in &self.series {
            if let Some(avg) = self.average(name) {
                out.insert(name.clone(), json!(avg));
            }
            out.insert(format!("{}_data", name), json!(values));
        }
        Value::Object(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn summary_keeps_average_and_raw_values() {
        let mut log = MetricLog::new();
        log.record("accuracy", 1.0);
        log.record("accuracy", 0.0);
        log.record("accuracy", 0.5);
        assert_eq!(log.average("accuracy"), Some(0.5));
        assert_eq!(log.last("accuracy"), Some(0.5));
        assert_eq!(
            log.summary(),
            json!({"accuracy": 0.5, "accuracy_data": [1.0, 0.0, 0.5]})
        );
        assert_eq!(log.average("loss"), None);
        assert!(log.all("loss").is_empty());
    }
}
