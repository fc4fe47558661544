use crate::warehouse::ParamValue;

/// Keeps bound parameter names clear of warehouse reserved words.
pub const PARAM_PREFIX: &str = "x__";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operator {
    Eq,
    Gt,
    Gte,
    Lt,
    Lte,
}

impl Operator {
    pub fn as_sql(self) -> &'static str {
        match self {
            Operator::Eq => "=",
            Operator::Gt => ">",
            Operator::Gte => ">=",
            Operator::Lt => "<",
            Operator::Lte => "<=",
        }
    }

    fn suffix(self) -> &'static str {
        match self {
            Operator::Eq => "eq",
            Operator::Gt => "gt",
            Operator::Gte => "gte",
            Operator::Lt => "lt",
            Operator::Lte => "lte",
        }
    }
}

// Longer suffixes first so `.gte` is not read as `.gt`.
const SUFFIXES: [(&str, Operator); 4] = [
    (".gte", Operator::Gte),
    (".lte", Operator::Lte),
    (".gt", Operator::Gt),
    (".lt", Operator::Lt),
];

/// A filter key parsed once into its field path, operator and parameter name.
#[derive(Debug, Clone, PartialEq)]
pub struct Predicate {
    pub key: String,
    pub field: String,
    pub operator: Operator,
    pub param_name: String,
    pub value: ParamValue,
}

impl Predicate {
    pub fn render(&self) -> String {
        format!("{} {} @{}", self.field, self.operator.as_sql(), self.param_name)
    }
}

/// Splits `meta__academy__gte` into (`meta.academy`, `>=`).
pub fn parse_key(key: &str) -> (String, Operator) {
    let dotted = key.replace("__", ".");
    for (suffix, operator) in SUFFIXES {
        if let Some(field) = dotted.strip_suffix(suffix) {
            if !field.is_empty() {
                return (field.to_string(), operator);
            }
        }
    }
    (dotted, Operator::Eq)
}

pub fn param_name(field: &str) -> String {
    format!("{PARAM_PREFIX}{}", field.replace('.', "__"))
}

/// Merges `key = value` into `predicates`. A repeated key overwrites the
/// earlier value in place; a second operator on the same field gets its own
/// parameter name.
pub fn upsert_predicate(predicates: &mut Vec<Predicate>, key: &str, value: ParamValue) {
    if let Some(existing) = predicates.iter_mut().find(|p| p.key == key) {
        existing.value = value;
        return;
    }

    let (field, operator) = parse_key(key);
    let mut name = param_name(&field);
    if predicates.iter().any(|p| p.param_name == name) {
        name = format!("{name}__{}", operator.suffix());
    }

    predicates.push(Predicate {
        key: key.to_string(),
        field,
        operator,
        param_name: name,
        value,
    });
}
