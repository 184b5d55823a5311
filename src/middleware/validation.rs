use validator::{Validate, ValidationErrors};

use crate::error::{AppError, AppResult};

/// Run `validator` rules on a request body, flattening field errors into a
/// single `InvalidInput` message
pub fn validate_body<T: Validate>(body: &T) -> AppResult<()> {
    body.validate()
        .map_err(|e| AppError::InvalidInput(format!("Validation failed: {}", describe(&e))))
}

fn describe(errors: &ValidationErrors) -> String {
    let mut fields: Vec<String> = errors
        .field_errors()
        .into_iter()
        .map(|(field, errors)| {
            let messages: Vec<String> = errors
                .iter()
                .map(|e| {
                    e.message
                        .as_ref()
                        .map(|s| s.to_string())
                        .unwrap_or_else(|| e.code.to_string())
                })
                .collect();
            format!("{}: {}", field, messages.join(", "))
        })
        .collect();
    fields.sort();
    fields.join("; ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Validate)]
    struct Body {
        #[validate(length(min = 1, message = "must not be empty"))]
        name: String,
        #[validate(range(max = 10))]
        count: u32,
    }

    #[test]
    fn test_messages_are_flattened() {
        let err = validate_body(&Body {
            name: String::new(),
            count: 11,
        })
        .unwrap_err();

        match err {
            AppError::InvalidInput(msg) => {
                assert!(msg.contains("name: must not be empty"));
                assert!(msg.contains("count: range"));
            }
            other => panic!("unexpected error {:?}", other),
        }
    }

    #[test]
    fn test_valid_body_passes() {
        assert!(validate_body(&Body {
            name: "ok".into(),
            count: 3
        })
        .is_ok());
    }
}
