use std::path::Path;

use onenight::{
    config::ExperimentPaths,
    script::PromptScript,
    Experiment, ExperimentConfig, ModelRegistry, PromptBook, ProviderKind,
};

#[test]
fn werewolf_demo_loads_against_the_default_registry() {
    let registry = ModelRegistry::from_yaml_str(include_str!("../config/models.yaml"))
        .expect("failed to parse models.yaml");
    let config = ExperimentConfig::from_yaml_str(include_str!("../demos/werewolf_4player/config.yaml"))
        .expect("failed to parse demo config");
    let prompts = PromptBook::from_yaml_str(include_str!("../demos/werewolf_4player/prompts.yaml"))
        .expect("failed to parse demo prompts");

    let experiment = Experiment::new(config, prompts, &registry).expect("demo experiment is invalid");
    assert_eq!(experiment.player_ids(), vec!["A", "B", "C", "D"]);
    assert_eq!(experiment.config.discussion_rounds, 2);

    for player in &experiment.players {
        assert!(player.prompts.discussion.user_prompt.contains("{conversation_history}"));
        assert!(player.prompts.vote.system_prompt.contains("\"vote\""));
    }

    let settings = registry
        .resolve_with("llama3-local", |_| None)
        .expect("llama3-local resolves");
    assert_eq!(settings.kind, ProviderKind::Ollama);
    assert_eq!(settings.base_url, "http://localhost:11434");
}

#[test]
fn experiment_paths_follow_the_directory_layout() {
    let paths = ExperimentPaths::from_dir("demos/werewolf_4player");
    assert_eq!(paths.prompts, Path::new("demos/werewolf_4player/prompts.yaml"));
    assert_eq!(paths.logs_dir, Path::new("demos/werewolf_4player/logs"));
}

#[test]
fn prompt_script_demo_loads() {
    let script = PromptScript::load(Path::new(env!("CARGO_MANIFEST_DIR")).join("demos/prompt_script/script.yaml"))
        .expect("failed to load prompt script");
    assert_eq!(script.model_name, "llama3-local");
    assert_eq!(script.turns.len(), 2);
    assert!(script.system_prompt.contains("One Night Werewolf"));
}
