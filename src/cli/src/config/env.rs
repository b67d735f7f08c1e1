#[derive(Debug, Clone, Default)]
pub(crate) struct Values {
  pub(crate) config: Option<String>,
  pub(crate) log_level: Option<String>,
}

#[derive(Debug, thiserror::Error)]
pub(crate) enum ParseError {
  #[error("Failed reading env var")]
  EnvVarRead(#[from] std::env::VarError),
}

pub(crate) fn parse() -> Result<Values, ParseError> {
  let _ = dotenv::dotenv();

  let values = Values {
    config: optional("RENOGY_CONFIG")?,
    log_level: optional("RENOGY_LOG_LEVEL")?,
  };

  Ok(values)
}

fn optional(key: &str) -> Result<Option<String>, ParseError> {
  match std::env::var(key) {
    Ok(value) => Ok(Some(value)),
    Err(std::env::VarError::NotPresent) => Ok(None),
    Err(error) => Err(error.into()),
  }
}
