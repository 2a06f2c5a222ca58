use super::*;

#[test]
fn cli_overrides_take_highest_precedence() {
    let mut raw = RawSettings::default();
    raw.server.port = Some(4000);
    raw.logging.level = Some("info".to_string());

    let overrides = ServeOverrides {
        server_port: Some(4321),
        log_level: Some("debug".to_string()),
        ..Default::default()
    };

    raw.apply_serve_overrides(&overrides);
    let settings = Settings::from_raw(raw).expect("valid settings");

    assert_eq!(settings.server.addr.port(), 4321);
    assert_eq!(settings.logging.level, LevelFilter::DEBUG);
}

#[test]
fn defaults_match_documented_values() {
    let settings = Settings::from_raw(RawSettings::default()).expect("valid settings");

    assert!(settings.database.url.is_none());
    assert_eq!(settings.database.change_channel, "datagate_changes");
    assert!(settings.cache.redis_url.is_none());
    assert_eq!(settings.cache.operation_timeout, Duration::from_millis(250));
    assert_eq!(settings.cache.max_page_size.get(), 100);
    assert!(!settings.cache.single_flight);
    assert_eq!(settings.cache.ttl.messages, 120);
    assert_eq!(settings.realtime.max_connections_per_user.get(), 5);
    assert_eq!(settings.realtime.idle_threshold, Duration::from_secs(1800));
    assert_eq!(settings.monitor.database_slow, Duration::from_millis(500));
    assert_eq!(settings.monitor.alert_capacity.get(), 100);
}

#[test]
fn blank_urls_disable_backends() {
    let mut raw = RawSettings::default();
    raw.database.url = Some("   ".to_string());
    raw.cache.redis_url = Some(String::new());

    let settings = Settings::from_raw(raw).expect("valid settings");
    assert!(settings.database.url.is_none());
    assert!(settings.cache.redis_url.is_none());
}

#[test]
fn zero_values_are_rejected_with_key() {
    let mut raw = RawSettings::default();
    raw.realtime.max_connections_per_user = Some(0);

    match Settings::from_raw(raw) {
        Err(LoadError::Invalid { key, .. }) => {
            assert_eq!(key, "realtime.max_connections_per_user")
        }
        other => panic!("expected invalid settings, got {other:?}"),
    }
}

#[test]
fn watch_tables_are_split_deduplicated_and_validated() {
    let mut raw = RawSettings::default();
    raw.realtime.watch_tables = Some("chats, messages,,chats".to_string());
    let settings = Settings::from_raw(raw).expect("valid settings");
    assert_eq!(settings.realtime.watch_tables, vec!["chats", "messages"]);

    let mut raw = RawSettings::default();
    raw.realtime.watch_tables = Some("chats;drop".to_string());
    assert!(Settings::from_raw(raw).is_err());
}

#[test]
fn cli_json_logging_enforces_format() {
    let mut raw = RawSettings::default();
    let overrides = ServeOverrides {
        log_json: Some(true),
        ..Default::default()
    };

    raw.apply_serve_overrides(&overrides);
    let settings = Settings::from_raw(raw).expect("valid settings");

    assert!(matches!(settings.logging.format, LogFormat::Json));
}

#[test]
fn default_to_serve_command() {
    let args = CliArgs::parse_from(["datagate"]);
    let command = args
        .command
        .unwrap_or(Command::Serve(Box::<ServeArgs>::default()));
    assert!(matches!(command, Command::Serve(_)));
}

#[test]
fn parse_serve_overrides() {
    let args = CliArgs::parse_from([
        "datagate",
        "serve",
        "--server-host",
        "0.0.0.0",
        "--redis-url",
        "redis://cache:6379",
        "--cache-single-flight",
        "true",
    ]);

    match args.command.expect("serve command") {
        Command::Serve(serve) => {
            assert_eq!(serve.overrides.server_host.as_deref(), Some("0.0.0.0"));
            assert_eq!(
                serve.overrides.redis_url.as_deref(),
                Some("redis://cache:6379")
            );
            assert_eq!(serve.overrides.cache_single_flight, Some(true));
        }
        _ => panic!("wrong command parsed"),
    }
}

#[test]
fn parse_migrate_arguments() {
    let args = CliArgs::parse_from([
        "datagate",
        "migrate",
        "--database-url",
        "postgres://example",
    ]);

    match args.command.expect("migrate command") {
        Command::Migrate(database) => {
            assert_eq!(database.database_url.as_deref(), Some("postgres://example"));
        }
        _ => panic!("wrong command parsed"),
    }
}

#[test]
#[serial_test::serial]
fn environment_layer_sits_below_cli() {
    // SAFETY: serialized with every other test that touches the environment.
    unsafe {
        std::env::set_var("DATAGATE__SERVER__PORT", "4100");
        std::env::set_var("DATAGATE__CACHE__MAX_PAGE_SIZE", "50");
    }

    let cli = CliArgs::parse_from(["datagate", "serve", "--server-port", "4200"]);
    let result = load(&cli);

    unsafe {
        std::env::remove_var("DATAGATE__SERVER__PORT");
        std::env::remove_var("DATAGATE__CACHE__MAX_PAGE_SIZE");
    }

    let settings = result.expect("valid settings");
    assert_eq!(settings.server.addr.port(), 4200);
    assert_eq!(settings.cache.max_page_size.get(), 50);
}
