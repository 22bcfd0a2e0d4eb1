use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// One entry of a `variables` response body.
///
/// `variables_reference == 0` means the value has no children to expand.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Variable {
    pub name: String,
    pub value: String,
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub type_name: Option<String>,
    #[serde(default)]
    pub variables_reference: i64,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Variable {
    #[must_use]
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
            type_name: None,
            variables_reference: 0,
            extra: Map::new(),
        }
    }

    #[must_use]
    pub fn with_type(mut self, type_name: impl Into<String>) -> Self {
        self.type_name = Some(type_name.into());
        self
    }

    #[must_use]
    pub fn with_reference(mut self, variables_reference: i64) -> Self {
        self.variables_reference = variables_reference;
        self
    }

    #[must_use]
    pub fn has_children(&self) -> bool {
        self.variables_reference > 0
    }

    /// Replace the value with a fully materialized one; nothing is left to expand.
    pub fn materialize(&mut self, value: String) {
        self.value = value;
        self.variables_reference = 0;
    }
}

/// Parse `body.variables` of a `variables` response.
pub fn variables_from_body(body: &Value) -> Result<Vec<Variable>, serde_json::Error> {
    match body.get("variables") {
        Some(list) => Vec::<Variable>::deserialize(list),
        None => Ok(Vec::new()),
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn keeps_adapter_specific_fields() {
        let raw = json!({
            "name": "count", "value": "3", "type": "int",
            "variablesReference": 0, "evaluateName": "this.count",
            "presentationHint": {"kind": "property"}
        });
        let var: Variable = serde_json::from_value(raw.clone()).unwrap();
        assert_eq!(var.type_name.as_deref(), Some("int"));
        assert_eq!(var.extra["evaluateName"], "this.count");
        assert_eq!(serde_json::to_value(&var).unwrap(), raw);
    }

    #[test]
    fn materialize_clears_reference() {
        let mut var = Variable::new("id", "{System.Guid}").with_reference(12);
        assert!(var.has_children());
        var.materialize("00000000-0000-0000-0000-000000000000".into());
        assert!(!var.has_children());
        assert_eq!(var.value.len(), 36);
    }
}
