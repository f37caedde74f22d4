//! Builders for test data.

#![allow(dead_code)]

use esvsync::EnvironmentInput;
use serde_json::json;

/// Builder for `EnvironmentInput` with test defaults.
pub struct EnvironmentBuilder {
    input: EnvironmentInput,
}

impl EnvironmentBuilder {
    pub fn new(name: &str) -> Self {
        Self {
            input: EnvironmentInput {
                name: name.to_string(),
                frodo_path: None,
                platform_url: format!("https://{}.example.com", name.to_lowercase()),
                service_account_id: format!("sa-{}", name.to_lowercase()),
                service_account_jwk: r#"{"kty":"RSA","n":"test"}"#.to_string(),
                exp_seconds: 899,
                scope: "fr:idm:*".to_string(),
                proxy: None,
            },
        }
    }

    pub fn proxy(mut self, proxy: &str) -> Self {
        self.input.proxy = Some(proxy.to_string());
        self
    }

    pub fn frodo_path(mut self, path: &str) -> Self {
        self.input.frodo_path = Some(path.to_string());
        self
    }

    pub fn build(self) -> EnvironmentInput {
        self.input
    }
}

/// Builder for the body of a `<name>.variable.json` file.
pub struct VariableFileBuilder {
    name: String,
    description: String,
    expression_type: String,
    value: String,
}

impl VariableFileBuilder {
    pub fn new(name: &str, value: &str) -> Self {
        Self {
            name: name.to_string(),
            description: String::new(),
            expression_type: "string".to_string(),
            value: value.to_string(),
        }
    }

    pub fn description(mut self, description: &str) -> Self {
        self.description = description.to_string();
        self
    }

    pub fn expression_type(mut self, expression_type: &str) -> Self {
        self.expression_type = expression_type.to_string();
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string_pretty(&json!({
            "variable": {
                &self.name: {
                    "_id": self.name,
                    "description": self.description,
                    "expressionType": self.expression_type,
                    "value": self.value,
                }
            }
        }))
        .expect("Failed to serialize variable file")
    }
}
