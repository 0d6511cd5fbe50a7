use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// A message travelling through the flow.
///
/// Apart from its id, a message is an open JSON object. `payload` is the
/// conventional main field but nodes may read and write any property.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Message {
    #[serde(rename = "_msgid")]
    id: String,
    #[serde(flatten)]
    fields: Map<String, Value>,
}

impl Message {
    pub fn new(payload: Value) -> Self {
        let mut fields = Map::new();
        fields.insert("payload".to_string(), payload);
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            fields,
        }
    }

    pub fn with_id(id: &str, payload: Value) -> Self {
        let mut msg = Self::new(payload);
        msg.id = id.to_string();
        msg
    }

    /// Builds a message from a JSON object. A `_msgid` field is kept, a
    /// missing one is generated.
    pub fn from_value(value: Value) -> Option<Self> {
        let Value::Object(mut fields) = value else {
            return None;
        };
        let id = match fields.remove("_msgid") {
            Some(Value::String(id)) => id,
            _ => uuid::Uuid::new_v4().to_string(),
        };
        Some(Self { id, fields })
    }

    pub fn id(&self) -> String {
        self.id.clone()
    }

    pub fn payload(&self) -> Option<&Value> {
        self.fields.get("payload")
    }

    pub fn set_payload(&mut self, payload: Value) {
        self.fields.insert("payload".to_string(), payload);
    }

    pub fn get(&self, name: &str) -> Option<&Value> {
        self.fields.get(name)
    }

    pub fn set(&mut self, name: &str, value: Value) {
        self.fields.insert(name.to_string(), value);
    }

    pub fn remove(&mut self, name: &str) -> Option<Value> {
        self.fields.remove(name)
    }

    pub fn fields(&self) -> &Map<String, Value> {
        &self.fields
    }

    /// Looks up a property expression such as `payload.user.name` or
    /// `topic[0]`. A leading `msg.` is accepted.
    pub fn property(&self, expr: &str) -> Option<&Value> {
        let expr = expr.trim();
        lookup_property(&self.fields, expr.strip_prefix("msg.").unwrap_or(expr))
    }
}

/// Resolves a dotted/bracketed property expression against a JSON object.
pub fn lookup_property<'a>(root: &'a Map<String, Value>, expr: &str) -> Option<&'a Value> {
    let segments = property_segments(expr.trim())?;
    let (first, rest) = segments.split_first()?;
    let mut current = match first {
        Segment::Key(key) => root.get(key.as_str())?,
        Segment::Index(_) => return None,
    };
    for segment in rest {
        current = match (segment, current) {
            (Segment::Key(key), Value::Object(map)) => map.get(key.as_str())?,
            (Segment::Index(i), Value::Array(items)) => items.get(*i)?,
            _ => return None,
        };
    }
    Some(current)
}

/// First key of a property expression, e.g. `user` for `user.name[0]`.
pub fn root_key(expr: &str) -> Option<String> {
    match property_segments(expr.trim())?.into_iter().next()? {
        Segment::Key(key) => Some(key),
        Segment::Index(_) => None,
    }
}

#[derive(Debug, PartialEq)]
enum Segment {
    Key(String),
    Index(usize),
}

/// Splits `a.b[2]["c.d"]` into segments. Returns `None` on malformed input.
fn property_segments(expr: &str) -> Option<Vec<Segment>> {
    let mut out = Vec::new();
    let mut chars = expr.chars().peekable();
    let mut key = String::new();

    while let Some(c) = chars.next() {
        match c {
            '.' => {
                if key.is_empty() {
                    return None;
                }
                out.push(Segment::Key(std::mem::take(&mut key)));
            }
            '[' => {
                if !key.is_empty() {
                    out.push(Segment::Key(std::mem::take(&mut key)));
                }
                let mut inner = String::new();
                loop {
                    match chars.next()? {
                        ']' => break,
                        ch => inner.push(ch),
                    }
                }
                let inner = inner.trim();
                let quoted = inner
                    .strip_prefix('"')
                    .and_then(|s| s.strip_suffix('"'))
                    .or_else(|| inner.strip_prefix('\'').and_then(|s| s.strip_suffix('\'')));
                match quoted {
                    Some(name) => out.push(Segment::Key(name.to_string())),
                    None => out.push(Segment::Index(inner.parse().ok()?)),
                }
                if chars.peek() == Some(&'.') {
                    chars.next();
                }
            }
            ch => key.push(ch),
        }
    }
    if !key.is_empty() {
        out.push(Segment::Key(key));
    }
    if out.is_empty() { None } else { Some(out) }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_message_creation() {
        let msg = Message::with_id("abc123", json!({"key": "value"}));
        assert_eq!(msg.id(), "abc123");
        assert_eq!(msg.payload(), Some(&json!({"key": "value"})));
    }

    #[test]
    fn test_property_lookup() {
        let mut msg = Message::new(json!({"user": {"name": "Ada", "tags": ["a", "b"]}}));
        msg.set("topic", json!("users"));

        assert_eq!(msg.property("payload.user.name"), Some(&json!("Ada")));
        assert_eq!(msg.property("msg.payload.user.tags[1]"), Some(&json!("b")));
        assert_eq!(msg.property("payload[\"user\"].name"), Some(&json!("Ada")));
        assert_eq!(msg.property("topic"), Some(&json!("users")));
        assert_eq!(msg.property("payload.missing"), None);
        assert_eq!(msg.property("payload..user"), None);
        assert_eq!(msg.property(""), None);
    }

    #[test]
    fn test_serde_keeps_msgid() {
        let msg = Message::with_id("id1", json!(1));
        let value = serde_json::to_value(&msg).unwrap();
        assert_eq!(value, json!({"_msgid": "id1", "payload": 1}));

        let back = Message::from_value(value).unwrap();
        assert_eq!(back, msg);
        assert!(Message::from_value(json!("nope")).is_none());
    }

    #[test]
    fn test_set_and_remove() {
        let mut msg = Message::new(json!(null));
        msg.set("priority", json!(3));
        assert_eq!(msg.get("priority"), Some(&json!(3)));
        assert_eq!(msg.remove("priority"), Some(json!(3)));
        assert!(msg.get("priority").is_none());
    }
}
