use super::*;

fn context(page_url: Option<&str>) -> CliContext {
    CliContext {
        config: ClientConfig::from_lookup(|_| None),
        page_url: page_url.map(|raw| Url::parse(raw).unwrap()),
    }
}

#[test]
fn translation_flag_splits_part_of_speech_and_text() {
    assert_eq!(parse_translation("noun: яблоко ").unwrap(), (PartOfSpeech::Noun, "яблоко".to_owned()));
    assert!(parse_translation("яблоко").is_err());
    assert!(parse_translation("thing:x").is_err());
}

#[test]
fn fills_up_to_three_translations() {
    let mut editor = TranslationEditor::default();
    let entries = vec![
        (PartOfSpeech::Noun, "run".to_owned()),
        (PartOfSpeech::Verb, "бежать".to_owned()),
        (PartOfSpeech::Adjective, "беглый".to_owned()),
    ];
    fill_translations(&mut editor, &entries).unwrap();
    assert_eq!(editor.texts(), vec!["run", "бежать", "беглый"]);
}

#[test]
fn fourth_translation_is_too_many() {
    let mut editor = TranslationEditor::default();
    let entries: Vec<_> = (0..4).map(|i| (PartOfSpeech::Noun, format!("t{i}"))).collect();
    let err = fill_translations(&mut editor, &entries).unwrap_err();
    assert!(matches!(err, CliError::TooManyTranslations));
}

#[test]
fn blank_later_translation_is_missing_not_too_many() {
    let mut editor = TranslationEditor::default();
    let entries = vec![(PartOfSpeech::Noun, "apple".to_owned()), (PartOfSpeech::Verb, String::new())];
    let err = fill_translations(&mut editor, &entries).unwrap_err();
    assert!(matches!(err, CliError::Client(Error::Validation(ValidationError::MissingTranslation))));
}

#[test]
fn page_url_gets_resolved_user_id() {
    let ctx = context(Some("https://app.example/room#tgWebAppData=user%3D%257B%2522id%2522%253A77%257D"));
    let user_id = ctx.user_id().unwrap();
    assert_eq!(user_id, "77");

    let url = ctx.page_url_with_user_id(&user_id).unwrap();
    assert_eq!(url.query(), Some("user_id=77"));
    assert!(context(None).page_url_with_user_id("77").is_none());
}
