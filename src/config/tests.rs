use super::*;

#[test]
fn defaults_are_valid() {
    let settings = Settings::from_raw(RawSettings::default()).expect("valid settings");

    assert_eq!(settings.logging.level, LevelFilter::INFO);
    assert!(matches!(settings.logging.format, LogFormat::Compact));
    assert_eq!(settings.database.url, None);
    assert_eq!(
        settings.database.max_connections.get(),
        DEFAULT_DB_MAX_CONNECTIONS
    );
    assert_eq!(settings.cache.prefix, "monitor");
    assert_eq!(settings.cache.period_seconds.get(), 1800);
    assert_eq!(settings.cache.lock_ttl_ms.get(), 4000);
    assert_eq!(settings.reaper.schedule, DEFAULT_REAPER_SCHEDULE);
}

#[test]
fn default_reaper_schedule_is_hourly() {
    let settings = Settings::from_raw(RawSettings::default()).expect("valid settings");
    let schedule = settings.reaper.cron_schedule().expect("default schedule");
    let upcoming: Vec<_> = schedule.upcoming(chrono::Utc).take(3).collect();

    assert_eq!(upcoming.len(), 3);
    assert_eq!((upcoming[1] - upcoming[0]).num_minutes(), 60);
}

#[test]
fn default_cache_settings_match_cache_config_defaults() {
    let settings = Settings::from_raw(RawSettings::default()).expect("valid settings");
    let from_settings = crate::cache::CacheConfig::from(&settings.cache);
    let default = crate::cache::CacheConfig::default();

    assert_eq!(from_settings.prefix, default.prefix);
    assert_eq!(from_settings.period(), default.period());
    assert_eq!(from_settings.lock_ttl(), default.lock_ttl());
}

#[test]
fn cli_overrides_take_highest_precedence() {
    let mut raw = RawSettings::default();
    raw.logging.level = Some("info".to_string());
    raw.database.url = Some("postgres://from-file".to_string());
    raw.reaper.schedule = Some("0 30 * * * *".to_string());

    let args = ReaperArgs {
        logging: LoggingOverrides {
            log_level: Some("debug".to_string()),
            log_json: Some(true),
        },
        database: DatabaseOverride {
            database_url: Some("postgres://from-cli".to_string()),
        },
        schedule: Some("0 */5 * * * *".to_string()),
    };

    raw.apply_reaper_overrides(&args);
    let settings = Settings::from_raw(raw).expect("valid settings");

    assert_eq!(settings.logging.level, LevelFilter::DEBUG);
    assert!(matches!(settings.logging.format, LogFormat::Json));
    assert_eq!(settings.database.url.as_deref(), Some("postgres://from-cli"));
    assert_eq!(settings.reaper.schedule, "0 */5 * * * *");
}

#[test]
fn blank_urls_are_treated_as_missing() {
    let mut raw = RawSettings::default();
    raw.database.url = Some("   ".to_string());
    raw.redis.lock_urls = vec![String::new()];

    let settings = Settings::from_raw(raw).expect("valid settings");
    assert_eq!(settings.database.url, None);
    assert!(settings.redis.lock_urls.is_empty());
}

#[test]
fn lock_servers_fall_back_to_store_url() {
    let mut raw = RawSettings::default();
    raw.redis.url = Some("redis://cache:6379".to_string());
    let settings = Settings::from_raw(raw.clone()).expect("valid settings");
    assert_eq!(settings.redis.lock_servers(), vec!["redis://cache:6379"]);

    raw.redis.lock_urls = vec![
        "redis://lock-a:6379".to_string(),
        "redis://lock-b:6379".to_string(),
        "redis://lock-c:6379".to_string(),
    ];
    let settings = Settings::from_raw(raw).expect("valid settings");
    assert_eq!(settings.redis.lock_servers().len(), 3);
}

#[test]
fn invalid_values_name_their_key() {
    let mut raw = RawSettings::default();
    raw.cache.lock_ttl_ms = Some(10);
    assert!(matches!(
        Settings::from_raw(raw),
        Err(LoadError::Invalid { key: "cache.lock_ttl_ms", .. })
    ));

    let mut raw = RawSettings::default();
    raw.cache.prefix = Some("a/b".to_string());
    assert!(matches!(
        Settings::from_raw(raw),
        Err(LoadError::Invalid { key: "cache.prefix", .. })
    ));

    let mut raw = RawSettings::default();
    raw.redis.url = Some("http://cache".to_string());
    assert!(matches!(
        Settings::from_raw(raw),
        Err(LoadError::Invalid { key: "redis.url", .. })
    ));

    let mut raw = RawSettings::default();
    raw.reaper.schedule = Some("every hour".to_string());
    assert!(matches!(
        Settings::from_raw(raw),
        Err(LoadError::Invalid { key: "reaper.schedule", .. })
    ));

    let mut raw = RawSettings::default();
    raw.logging.level = Some("loud".to_string());
    assert!(matches!(
        Settings::from_raw(raw),
        Err(LoadError::Invalid { key: "logging.level", .. })
    ));
}

#[test]
fn no_subcommand_parses() {
    let args = CliArgs::parse_from(["tagcache"]);
    assert!(args.command.is_none());
    assert!(args.config_file.is_none());
}

#[test]
fn parse_invalidate_arguments() {
    let args = CliArgs::parse_from([
        "tagcache",
        "invalidate",
        "--label",
        "get_runs",
        "--all-of",
        "problem_id=7",
        "--all-of",
        "user_ids=1,2",
        "--any-of",
        "time_after=2024",
        "--redis-url",
        "redis://override",
    ]);

    match args.command.expect("invalidate command") {
        Command::Invalidate(invalidate) => {
            assert_eq!(invalidate.label, "get_runs");
            assert_eq!(invalidate.all_of, vec!["problem_id=7", "user_ids=1,2"]);
            assert_eq!(invalidate.any_of, vec!["time_after=2024"]);
            assert_eq!(invalidate.redis_url.as_deref(), Some("redis://override"));
            assert_eq!(invalidate.prefix, None);
        }
        _ => panic!("wrong command parsed"),
    }
}

#[test]
fn invalidate_overrides_prefix_and_store() {
    let mut raw = RawSettings::default();
    let args = CliArgs::parse_from([
        "tagcache",
        "invalidate",
        "--label",
        "get_runs",
        "--prefix",
        "standings",
        "--redis-url",
        "redis://override:6379",
    ]);
    let Some(Command::Invalidate(invalidate)) = args.command else {
        panic!("wrong command parsed");
    };

    raw.apply_invalidate_overrides(&invalidate);
    let settings = Settings::from_raw(raw).expect("valid settings");
    assert_eq!(settings.cache.prefix, "standings");
    assert_eq!(settings.redis.url.as_deref(), Some("redis://override:6379"));
}

#[test]
fn parse_migrate_arguments() {
    let args = CliArgs::parse_from([
        "tagcache",
        "migrate",
        "--database-url",
        "postgres://example",
    ]);

    match args.command.expect("migrate command") {
        Command::Migrate(migrate) => {
            assert_eq!(
                migrate.database.database_url.as_deref(),
                Some("postgres://example")
            );
        }
        _ => panic!("wrong command parsed"),
    }
}
