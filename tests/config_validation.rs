//! Integration tests for configuration loading and validation.

use standin::config::Config;

fn parse(yaml: &str) -> Config {
    let mut config: Config = serde_yaml::from_str(yaml).unwrap();
    config.post_deserialize().unwrap();
    config
}

#[test]
fn test_yaml_parse_minimal() {
    let yaml = "bot_token: tok\nbot_username: bot\n";
    let config: Config = serde_yaml::from_str(yaml).unwrap();
    assert_eq!(config.bot_token, "tok");
    assert_eq!(config.bot_username, "bot");
    // Defaults
    assert_eq!(config.owner_id, 0);
    assert_eq!(config.gemini_model, "gemini-1.5-flash-latest");
    assert_eq!(config.gemini_base_url, None);
    assert_eq!(config.data_dir, "./standin.data");
    assert_eq!(config.timezone, "UTC");
    assert_eq!(config.favorite_vip, None);
    assert_eq!(config.delay_min, 3);
    assert_eq!(config.delay_max, 8);
}

#[test]
fn test_yaml_parse_full() {
    let yaml = r#"
bot_token: my_token
bot_username: "@mybot"
owner_id: 123456
gemini_model: gemini-1.5-pro-latest
gemini_base_url: https://custom.api.com/v1beta
data_dir: /data/standin
timezone: Asia/Kolkata
favorite_vip: Maya
delay_min: 2
delay_max: 12
"#;
    let config = parse(yaml);
    assert_eq!(config.bot_token, "my_token");
    // Leading @ is stripped during validation.
    assert_eq!(config.bot_username, "mybot");
    assert_eq!(config.owner_id, 123456);
    assert_eq!(config.gemini_model, "gemini-1.5-pro-latest");
    assert_eq!(
        config.gemini_base_url.as_deref(),
        Some("https://custom.api.com/v1beta")
    );
    assert_eq!(config.data_dir, "/data/standin");
    assert_eq!(config.timezone, "Asia/Kolkata");
    assert_eq!(config.favorite_vip.as_deref(), Some("Maya"));
    assert_eq!(config.delay_min, 2);
    assert_eq!(config.delay_max, 12);
}

#[test]
fn test_yaml_roundtrip() {
    let config = parse("bot_token: tok\nbot_username: bot\nowner_id: 7\n");
    let yaml = serde_yaml::to_string(&config).unwrap();
    let parsed: Config = serde_yaml::from_str(&yaml).unwrap();
    assert_eq!(parsed.bot_token, config.bot_token);
    assert_eq!(parsed.owner_id, config.owner_id);
    assert_eq!(parsed.timezone, config.timezone);
}

#[test]
fn test_delay_bounds_normalized() {
    let config = parse("bot_token: tok\nbot_username: bot\ndelay_min: 20\ndelay_max: 5\n");
    assert_eq!((config.delay_min, config.delay_max), (5, 20));

    let config = parse("bot_token: tok\nbot_username: bot\ndelay_min: 0\ndelay_max: 99\n");
    assert_eq!((config.delay_min, config.delay_max), (1, 30));
}

#[test]
fn test_unknown_timezone_rejected() {
    let mut config: Config =
        serde_yaml::from_str("bot_token: tok\ntimezone: Mars/Olympus\n").unwrap();
    assert!(config.post_deserialize().is_err());
}

#[test]
fn test_yaml_unknown_fields_ignored() {
    let yaml = "bot_token: tok\nbot_username: bot\nunknown_field: value\n";
    let config: Config = serde_yaml::from_str(yaml).unwrap();
    assert_eq!(config.bot_token, "tok");
}
