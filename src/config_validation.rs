//! Field-level validation for run configuration.
//!
//! Validators return [`ValidationError`]s carrying the field that failed.
//! [`ValidationContext`] tracks the current field path (for example
//! `scenarios[1].stages[0].target`) and collects every error so a config
//! file can be fixed in one pass instead of one error at a time.

use thiserror::Error;
use tokio::time::Duration;

use crate::utils::parse_duration_string;

/// Validation error with context about which field failed.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ValidationError {
    #[error("Field '{field}': {message}")]
    FieldError { field: String, message: String },

    #[error("Field '{field}' is required but not provided")]
    RequiredField { field: String },

    #[error("Field '{field}': value {value} is out of range ({min} to {max})")]
    OutOfRange {
        field: String,
        value: String,
        min: String,
        max: String,
    },

    #[error("Field '{field}': invalid format - {message}")]
    InvalidFormat { field: String, message: String },

    #[error("Field '{field}': invalid enum value '{value}'. Expected one of: {expected}")]
    InvalidEnum {
        field: String,
        value: String,
        expected: String,
    },

    #[error("Multiple validation errors: {0}")]
    Multiple(String),
}

pub type ValidationResult<T> = Result<T, ValidationError>;

/// Collects errors while walking a config tree.
#[derive(Debug, Default)]
pub struct ValidationContext {
    field_path: Vec<String>,
    errors: Vec<ValidationError>,
}

impl ValidationContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Enter a nested field context.
    pub fn enter(&mut self, field: &str) {
        self.field_path.push(field.to_string());
    }

    /// Enter the `index`th element of a list field.
    pub fn enter_index(&mut self, index: usize) {
        match self.field_path.last_mut() {
            Some(last) => last.push_str(&format!("[{}]", index)),
            None => self.field_path.push(format!("[{}]", index)),
        }
    }

    /// Leave a context entered with [`enter_index`](Self::enter_index).
    pub fn exit_index(&mut self) {
        if let Some(last) = self.field_path.last_mut() {
            if let Some(open) = last.rfind('[') {
                last.truncate(open);
            }
        }
    }

    /// Exit the current field context.
    pub fn exit(&mut self) {
        self.field_path.pop();
    }

    /// Get the current field path as a string.
    pub fn current_path(&self) -> String {
        self.field_path.join(".")
    }

    pub fn add_error(&mut self, error: ValidationError) {
        self.errors.push(error);
    }

    /// Add a field error at the current path.
    pub fn field_error(&mut self, message: impl Into<String>) {
        self.add_error(ValidationError::FieldError {
            field: self.current_path(),
            message: message.into(),
        });
    }

    /// Records `result`'s error, if any, at the current path and returns
    /// the value otherwise.
    pub fn check<T>(&mut self, result: ValidationResult<T>) -> Option<T> {
        match result {
            Ok(value) => Some(value),
            Err(e) => {
                self.field_error(e.to_string());
                None
            }
        }
    }

    pub fn has_errors(&self) -> bool {
        !self.errors.is_empty()
    }

    pub fn errors(&self) -> &[ValidationError] {
        &self.errors
    }

    /// Consume the context and return a result.
    pub fn into_result(self) -> Result<(), ValidationError> {
        if self.errors.is_empty() {
            Ok(())
        } else {
            let messages: Vec<String> = self.errors.iter().map(|e| e.to_string()).collect();
            Err(ValidationError::Multiple(messages.join("; ")))
        }
    }
}

/// Validator for target URLs.
pub struct UrlValidator;

impl UrlValidator {
    pub fn validate(url: &str) -> ValidationResult<()> {
        let invalid = |message: String| ValidationError::InvalidFormat {
            field: "url".to_string(),
            message,
        };

        if url.is_empty() {
            return Err(invalid("URL cannot be empty".to_string()));
        }
        if !url.starts_with("http://") && !url.starts_with("https://") {
            return Err(invalid(format!(
                "URL must start with http:// or https://, got: {}",
                url
            )));
        }
        if url.contains(char::is_whitespace) {
            return Err(invalid("URL cannot contain whitespace".to_string()));
        }
        Ok(())
    }
}

/// Validator for duration strings.
pub struct DurationValidator;

impl DurationValidator {
    pub fn parse(duration_str: &str) -> ValidationResult<Duration> {
        parse_duration_string(duration_str).map_err(|e| ValidationError::InvalidFormat {
            field: "duration".to_string(),
            message: format!("Invalid duration format '{}': {}", duration_str, e),
        })
    }

    pub fn parse_positive(duration_str: &str) -> ValidationResult<Duration> {
        let duration = Self::parse(duration_str)?;
        if duration.is_zero() {
            return Err(ValidationError::OutOfRange {
                field: "duration".to_string(),
                value: duration_str.to_string(),
                min: "1ms".to_string(),
                max: "unlimited".to_string(),
            });
        }
        Ok(duration)
    }
}

/// Validator for numeric ranges.
pub struct RangeValidator;

impl RangeValidator {
    pub fn validate_u64(value: u64, min: u64, max: u64, field: &str) -> ValidationResult<()> {
        if value < min || value > max {
            return Err(ValidationError::OutOfRange {
                field: field.to_string(),
                value: value.to_string(),
                min: min.to_string(),
                max: max.to_string(),
            });
        }
        Ok(())
    }

    pub fn validate_f64(value: f64, min: f64, max: f64, field: &str) -> ValidationResult<()> {
        if !(min..=max).contains(&value) {
            return Err(ValidationError::OutOfRange {
                field: field.to_string(),
                value: value.to_string(),
                min: min.to_string(),
                max: max.to_string(),
            });
        }
        Ok(())
    }

    pub fn validate_positive_u64(value: u64, field: &str) -> ValidationResult<()> {
        Self::validate_u64(value, 1, u64::MAX, field)
    }
}

/// Validator for arrival rates (requests per second).
pub struct RateValidator;

impl RateValidator {
    /// Finite and non-negative.
    pub fn validate(rate: f64, field: &str) -> ValidationResult<()> {
        if !rate.is_finite() || rate < 0.0 {
            return Err(ValidationError::OutOfRange {
                field: field.to_string(),
                value: rate.to_string(),
                min: "0".to_string(),
                max: "unlimited".to_string(),
            });
        }
        Ok(())
    }
}

/// Validator for worker pool bounds.
pub struct WorkerBoundsValidator;

impl WorkerBoundsValidator {
    pub fn validate(preallocated: usize, max: usize) -> ValidationResult<()> {
        RangeValidator::validate_positive_u64(preallocated as u64, "preAllocatedWorkers")?;
        if max < preallocated {
            return Err(ValidationError::FieldError {
                field: "maxWorkers".to_string(),
                message: format!(
                    "maxWorkers ({}) must be >= preAllocatedWorkers ({})",
                    max, preallocated
                ),
            });
        }
        Ok(())
    }
}

/// Validator for HTTP methods.
pub struct HttpMethodValidator;

impl HttpMethodValidator {
    const VALID_METHODS: &'static [&'static str] =
        &["GET", "POST", "PUT", "PATCH", "DELETE", "HEAD", "OPTIONS"];

    pub fn parse(method: &str) -> ValidationResult<reqwest::Method> {
        let method_upper = method.trim().to_uppercase();
        if !Self::VALID_METHODS.contains(&method_upper.as_str()) {
            return Err(ValidationError::InvalidEnum {
                field: "method".to_string(),
                value: method.to_string(),
                expected: Self::VALID_METHODS.join(", "),
            });
        }
        reqwest::Method::from_bytes(method_upper.as_bytes()).map_err(|e| {
            ValidationError::InvalidFormat {
                field: "method".to_string(),
                message: e.to_string(),
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_url_validator_valid() {
        assert!(UrlValidator::validate("https://example.com").is_ok());
        assert!(UrlValidator::validate("http://localhost:8001/api/test").is_ok());
    }

    #[test]
    fn test_url_validator_invalid() {
        assert!(UrlValidator::validate("").is_err());
        assert!(UrlValidator::validate("localhost:8000").is_err());
        assert!(UrlValidator::validate("ftp://example.com").is_err());
        assert!(UrlValidator::validate("http://example .com").is_err());
    }

    #[test]
    fn test_duration_validator() {
        assert_eq!(DurationValidator::parse("30s").unwrap(), Duration::from_secs(30));
        assert_eq!(
            DurationValidator::parse_positive("150ms").unwrap(),
            Duration::from_millis(150)
        );
        assert!(DurationValidator::parse("invalid").is_err());
        assert!(DurationValidator::parse_positive("0s").is_err());
    }

    #[test]
    fn test_range_and_rate_validators() {
        assert!(RangeValidator::validate_u64(50, 1, 100, "test").is_ok());
        assert!(RangeValidator::validate_u64(101, 1, 100, "test").is_err());
        assert!(RangeValidator::validate_f64(0.5, 0.0, 1.0, "fraction").is_ok());
        assert!(RangeValidator::validate_f64(f64::NAN, 0.0, 1.0, "fraction").is_err());
        assert!(RateValidator::validate(0.0, "target").is_ok());
        assert!(RateValidator::validate(-1.0, "target").is_err());
        assert!(RateValidator::validate(f64::INFINITY, "target").is_err());
    }

    #[test]
    fn test_worker_bounds() {
        assert!(WorkerBoundsValidator::validate(200, 4000).is_ok());
        assert!(WorkerBoundsValidator::validate(0, 10).is_err());
        assert!(WorkerBoundsValidator::validate(10, 5).is_err());
    }

    #[test]
    fn test_http_method_validator() {
        assert_eq!(HttpMethodValidator::parse("get").unwrap(), reqwest::Method::GET);
        assert_eq!(HttpMethodValidator::parse("POST").unwrap(), reqwest::Method::POST);
        assert!(HttpMethodValidator::parse("FETCH").is_err());
    }

    #[test]
    fn test_validation_context_paths() {
        let mut ctx = ValidationContext::new();
        ctx.enter("scenarios");
        ctx.enter_index(1);
        ctx.enter("stages");
        ctx.enter_index(0);
        assert_eq!(ctx.current_path(), "scenarios[1].stages[0]");

        assert_eq!(ctx.check(RateValidator::validate(-2.0, "target")), None);
        assert!(ctx.has_errors());

        ctx.exit_index();
        ctx.exit();
        ctx.exit_index();
        assert_eq!(ctx.current_path(), "scenarios");
        ctx.exit();
        assert_eq!(ctx.current_path(), "");

        let err = ctx.into_result().unwrap_err();
        assert!(err.to_string().contains("scenarios[1].stages[0]"));
    }
}
