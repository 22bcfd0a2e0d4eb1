//! Post-processors for debugger-reported variable values.
//!
//! A [`ValueConverter`] may expand a variable's children through
//! [`NestedVariables`] (a synthetic `variables` request the session routes
//! out-of-band) and replace its value with a materialized string.
//! [`ConverterPipeline`] applies the first converter whose `can_convert`
//! matches; on failure the original variable is kept.

use std::sync::Arc;

use futures_util::future::BoxFuture;

use crate::variables::Variable;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConversionError {
    #[error("missing field {field}")]
    MissingField { field: &'static str },
    #[error("field {field} has non-numeric value {value:?}")]
    InvalidField { field: &'static str, value: String },
    #[error("nested variables request failed: {0}")]
    Nested(String),
}

/// Resolves the children of a variable via a synthetic `variables` request.
pub trait NestedVariables: Send + Sync {
    fn variables(&self, variables_reference: i64)
    -> BoxFuture<'_, Result<Vec<Variable>, ConversionError>>;
}

pub trait ValueConverter: Send + Sync {
    fn name(&self) -> &'static str;

    fn can_convert(&self, variable: &Variable) -> bool;

    fn convert<'a>(
        &'a self,
        variable: &'a Variable,
        nested: &'a dyn NestedVariables,
    ) -> BoxFuture<'a, Result<Variable, ConversionError>>;
}

/// Ordered, first-match-wins list of converters.
#[derive(Clone, Default)]
pub struct ConverterPipeline {
    converters: Vec<Arc<dyn ValueConverter>>,
}

impl std::fmt::Debug for ConverterPipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list()
            .entries(self.converters.iter().map(|c| c.name()))
            .finish()
    }
}

impl ConverterPipeline {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Pipeline with the built-in converters.
    #[must_use]
    pub fn with_defaults() -> Self {
        Self::new().with(GuidConverter)
    }

    #[must_use]
    pub fn with(mut self, converter: impl ValueConverter + 'static) -> Self {
        self.converters.push(Arc::new(converter));
        self
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.converters.is_empty()
    }

    pub async fn apply(&self, variable: Variable, nested: &dyn NestedVariables) -> Variable {
        let Some(converter) = self.converters.iter().find(|c| c.can_convert(&variable)) else {
            return variable;
        };
        match converter.convert(&variable, nested).await {
            Ok(converted) => converted,
            Err(e) => {
                tracing::warn!(
                    converter = converter.name(),
                    variable = %variable.name,
                    "Conversion failed, keeping original value: {e}"
                );
                variable
            }
        }
    }

    /// Convert each variable in order. Conversions run one at a time.
    pub async fn apply_all(
        &self,
        variables: Vec<Variable>,
        nested: &dyn NestedVariables,
    ) -> Vec<Variable> {
        let mut out = Vec::with_capacity(variables.len());
        for variable in variables {
            out.push(self.apply(variable, nested).await);
        }
        out
    }
}

/// Rebuilds `System.Guid` values from their backing fields.
///
/// The runtime lays a GUID out as `_a: int`, `_b`/`_c: short`, `_d`..`_k: byte`.
#[derive(Debug, Clone, Copy, Default)]
pub struct GuidConverter;

const GUID_TYPE: &str = "System.Guid";
const GUID_BYTE_FIELDS: [&str; 8] = ["_d", "_e", "_f", "_g", "_h", "_i", "_j", "_k"];

impl ValueConverter for GuidConverter {
    fn name(&self) -> &'static str {
        "guid"
    }

    fn can_convert(&self, variable: &Variable) -> bool {
        variable.has_children()
            && variable
                .type_name
                .as_deref()
                .is_some_and(|t| t.trim_end_matches('?') == GUID_TYPE)
    }

    fn convert<'a>(
        &'a self,
        variable: &'a Variable,
        nested: &'a dyn NestedVariables,
    ) -> BoxFuture<'a, Result<Variable, ConversionError>> {
        Box::pin(async move {
            let fields = nested.variables(variable.variables_reference).await?;
            let field = |name: &'static str| {
                fields
                    .iter()
                    .find(|f| f.name == name)
                    .map(|f| f.value.as_str())
                    .ok_or(ConversionError::MissingField { field: name })
            };

            let a = parse_bits("_a", field("_a")?, 32)? as u32;
            let b = parse_bits("_b", field("_b")?, 16)? as u16;
            let c = parse_bits("_c", field("_c")?, 16)? as u16;
            let mut tail = [0u8; 8];
            for (slot, name) in tail.iter_mut().zip(GUID_BYTE_FIELDS) {
                *slot = parse_bits(name, field(name)?, 8)? as u8;
            }

            let mut converted = variable.clone();
            converted.materialize(format_guid(a, b, c, tail));
            Ok(converted)
        })
    }
}

/// Parse a backing field of `bits` width into its unsigned bit pattern.
///
/// Accepts what debuggers print: decimal (signed or unsigned range) or
/// `0x`-prefixed hex, optionally followed by a char literal (`65 'A'`).
fn parse_bits(field: &'static str, raw: &str, bits: u32) -> Result<u64, ConversionError> {
    let invalid = || ConversionError::InvalidField {
        field,
        value: raw.to_string(),
    };
    let mask = (1u64 << bits) - 1;
    let token = raw.split_whitespace().next().ok_or_else(invalid)?;

    if let Some(hex) = token.strip_prefix("0x").or_else(|| token.strip_prefix("0X")) {
        let value = u64::from_str_radix(hex, 16).map_err(|_| invalid())?;
        return if value <= mask { Ok(value) } else { Err(invalid()) };
    }

    let value: i64 = token.parse().map_err(|_| invalid())?;
    let min = -(1i64 << (bits - 1));
    if value < min || value > mask as i64 {
        return Err(invalid());
    }
    Ok(value as u64 & mask)
}

fn format_guid(a: u32, b: u16, c: u16, tail: [u8; 8]) -> String {
    format!(
        "{a:08x}-{b:04x}-{c:04x}-{:02x}{:02x}-{:02x}{:02x}{:02x}{:02x}{:02x}{:02x}",
        tail[0], tail[1], tail[2], tail[3], tail[4], tail[5], tail[6], tail[7]
    )
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    struct Fields(HashMap<i64, Vec<Variable>>);

    impl NestedVariables for Fields {
        fn variables(
            &self,
            variables_reference: i64,
        ) -> BoxFuture<'_, Result<Vec<Variable>, ConversionError>> {
            let result = self
                .0
                .get(&variables_reference)
                .cloned()
                .ok_or_else(|| ConversionError::Nested("unknown reference".into()));
            Box::pin(async move { result })
        }
    }

    fn guid_fields(skip: Option<&str>) -> Vec<Variable> {
        // 6f9619ff-8b86-d011-b42d-00c04fc964ff
        let values = [
            ("_a", "1872108031"),
            ("_b", "-29818"),
            ("_c", "-12271"),
            ("_d", "180"),
            ("_e", "45"),
            ("_f", "0"),
            ("_g", "192"),
            ("_h", "0x4f"),
            ("_i", "201"),
            ("_j", "100"),
            ("_k", "255"),
        ];
        values
            .into_iter()
            .filter(|(name, _)| Some(*name) != skip)
            .map(|(name, value)| Variable::new(name, value))
            .collect()
    }

    fn guid_variable() -> Variable {
        Variable::new("Id", "{System.Guid}")
            .with_type("System.Guid")
            .with_reference(7)
    }

    #[tokio::test]
    async fn converts_complete_guid() {
        let nested = Fields(HashMap::from([(7, guid_fields(None))]));
        let pipeline = ConverterPipeline::with_defaults();

        let converted = pipeline.apply(guid_variable(), &nested).await;
        assert_eq!(converted.value, "6f9619ff-8b86-d011-b42d-00c04fc964ff");
        assert_eq!(converted.value.len(), 36);
        assert_eq!(converted.variables_reference, 0);
        assert_eq!(converted.name, "Id");
    }

    #[tokio::test]
    async fn missing_field_keeps_original() {
        let nested = Fields(HashMap::from([(7, guid_fields(Some("_h")))]));
        let original = guid_variable();

        let err = GuidConverter.convert(&original, &nested).await.unwrap_err();
        assert_eq!(err, ConversionError::MissingField { field: "_h" });

        let result = ConverterPipeline::with_defaults()
            .apply(original.clone(), &nested)
            .await;
        assert_eq!(result, original);
    }

    #[tokio::test]
    async fn non_numeric_field_is_invalid() {
        let mut fields = guid_fields(Some("_b"));
        fields.push(Variable::new("_b", "<error>"));
        let nested = Fields(HashMap::from([(7, fields)]));

        let err = GuidConverter.convert(&guid_variable(), &nested).await.unwrap_err();
        assert!(matches!(err, ConversionError::InvalidField { field: "_b", .. }));
    }

    #[test]
    fn field_widths_accept_signed_and_hex_forms() {
        assert_eq!(parse_bits("_b", "-1", 16).unwrap(), 0xffff);
        assert_eq!(parse_bits("_b", "0xffff", 16).unwrap(), 0xffff);
        assert_eq!(parse_bits("_d", "65 'A'", 8).unwrap(), 65);
        assert!(parse_bits("_d", "256", 8).is_err());
        assert!(parse_bits("_a", "0x1ffffffff", 32).is_err());
    }

    #[test]
    fn only_expandable_guids_match() {
        assert!(GuidConverter.can_convert(&guid_variable()));
        assert!(GuidConverter.can_convert(&guid_variable().with_type("System.Guid?")));
        assert!(!GuidConverter.can_convert(&guid_variable().with_reference(0)));
        assert!(!GuidConverter.can_convert(&guid_variable().with_type("System.String")));
    }

    struct Tagging(&'static str);

    impl ValueConverter for Tagging {
        fn name(&self) -> &'static str {
            self.0
        }

        fn can_convert(&self, _variable: &Variable) -> bool {
            true
        }

        fn convert<'a>(
            &'a self,
            variable: &'a Variable,
            _nested: &'a dyn NestedVariables,
        ) -> BoxFuture<'a, Result<Variable, ConversionError>> {
            Box::pin(async move {
                let mut v = variable.clone();
                v.value = format!("{}:{}", self.0, v.value);
                Ok(v)
            })
        }
    }

    #[tokio::test]
    async fn first_match_wins_without_chaining() {
        let pipeline = ConverterPipeline::new()
            .with(Tagging("first"))
            .with(Tagging("second"));
        let nested = Fields(HashMap::new());

        let out = pipeline
            .apply_all(vec![Variable::new("x", "1"), Variable::new("y", "2")], &nested)
            .await;
        assert_eq!(out[0].value, "first:1");
        assert_eq!(out[1].value, "first:2");
    }
}
