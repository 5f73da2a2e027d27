//! Start command - one-shot instance run against in-memory storage

use std::path::PathBuf;

use clap::Args;
use serde_json::Value;

use super::{bootstrap, load_templates};
use crate::domain::process::{ProcessStart, TemplateId};

#[derive(Args, Clone)]
pub struct StartArgs {
    /// Template id to instantiate
    pub template: String,

    /// Directory of JSON process templates
    #[arg(long, default_value = "demos")]
    pub templates: PathBuf,

    /// Principal starting the instance
    #[arg(long, default_value = "cli")]
    pub starter: String,

    #[arg(long)]
    pub tenant: Option<String>,

    /// Start variable as KEY=VALUE; VALUE is parsed as JSON, else taken as a string
    #[arg(long = "var", value_parser = parse_variable)]
    pub vars: Vec<(String, Value)>,
}

pub async fn run(args: StartArgs) -> anyhow::Result<()> {
    let config = bootstrap();

    let templates = load_templates(&args.templates)?;
    let app = crate::create_flow_app(&config, templates).await?;

    let mut start = ProcessStart::new(TemplateId::new(&args.template)?, &args.starter);
    if let Some(tenant) = &args.tenant {
        start = start.with_tenant(tenant);
    }
    for (key, value) in args.vars {
        start = start.with_variable(key, value);
    }

    let outcome = async {
        let instance_id = app.service.start(start).await?;
        app.service.wait_idle().await;
        let document = app.service.document(&instance_id).await?;
        anyhow::Ok(serde_json::to_string_pretty(&document)?)
    }
    .await;

    app.shutdown().await;
    println!("{}", outcome?);
    Ok(())
}

fn parse_variable(raw: &str) -> Result<(String, Value), String> {
    let (key, value) = raw
        .split_once('=')
        .ok_or_else(|| format!("expected KEY=VALUE, got '{}'", raw))?;
    if key.is_empty() {
        return Err(format!("empty variable name in '{}'", raw));
    }
    let value = serde_json::from_str(value).unwrap_or_else(|_| Value::String(value.to_string()));
    Ok((key.to_string(), value))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_variable() {
        assert_eq!(parse_variable("amount=120").unwrap(), ("amount".to_string(), json!(120)));
        assert_eq!(
            parse_variable("owner=alice").unwrap(),
            ("owner".to_string(), json!("alice"))
        );
        assert_eq!(
            parse_variable("tags=[\"a\",\"b\"]").unwrap(),
            ("tags".to_string(), json!(["a", "b"]))
        );
        assert!(parse_variable("novalue").is_err());
        assert!(parse_variable("=1").is_err());
    }
}
