use super::*;

#[test]
fn provider_defaults_to_anthropic() {
    assert_eq!(parse_provider(None).unwrap(), LlmProviderKind::Anthropic);
    assert_eq!(parse_provider(Some("anthropic")).unwrap(), LlmProviderKind::Anthropic);
    assert_eq!(parse_provider(Some("openai")).unwrap(), LlmProviderKind::OpenAi);
}

#[test]
fn unknown_provider_errors() {
    let err = parse_provider(Some("bad")).unwrap_err().to_string();
    assert!(err.contains("unknown LLM_PROVIDER"));
}

#[test]
fn default_models_per_provider() {
    assert_eq!(default_model(LlmProviderKind::Anthropic), "claude-sonnet-4-5-20250929");
    assert_eq!(default_model(LlmProviderKind::OpenAi), "gpt-4o");
}

#[test]
fn env_parse_u64_falls_back_on_absent_var() {
    assert_eq!(env_parse_u64("AIRCHAT_TEST_NO_SUCH_VAR_0X9", 17), 17);
}
