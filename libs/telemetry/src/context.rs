#[derive(Debug, Clone)]
pub struct TelemetryLabels {
    pub source: String,
    pub channel_id: Option<String>,
    pub msg_id: Option<String>,
    pub extra: Vec<(String, String)>,
}

impl TelemetryLabels {
    pub fn new(source: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            channel_id: None,
            msg_id: None,
            extra: Vec::new(),
        }
    }

    pub fn with_extra(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.extra.push((key.into(), value.into()));
        self
    }

    pub fn tags(&self) -> Vec<(String, String)> {
        let mut tags = Vec::with_capacity(3 + self.extra.len());
        tags.push(("source".into(), self.source.clone()));
        if let Some(chat) = &self.channel_id {
            tags.push(("channel_id".into(), chat.clone()));
        }
        if let Some(msg) = &self.msg_id {
            tags.push(("msg_id".into(), msg.clone()));
        }
        for (key, value) in &self.extra {
            tags.push((key.clone(), value.clone()));
        }
        tags
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tags_keep_insertion_order() {
        let mut labels = TelemetryLabels::new("telegram").with_extra("reason", "empty");
        labels.channel_id = Some("555".into());
        assert_eq!(
            labels.tags(),
            vec![
                ("source".to_string(), "telegram".to_string()),
                ("channel_id".to_string(), "555".to_string()),
                ("reason".to_string(), "empty".to_string()),
            ]
        );
    }
}
