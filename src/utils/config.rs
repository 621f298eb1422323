//! Configuration parsing helper: defaults plus TOML overrides.

/// Builds a configuration struct from its `Default` values, overridden by
/// whichever of the listed fields appear in the given TOML string (pass
/// `None` to keep pure defaults). Fields not named in the invocation, and
/// keys the struct does not have, are rejected rather than ignored, so a
/// typo in an override never goes unnoticed.
///
/// Example:
/// ```
/// use rangemaster::master::MasterConfig;
/// use rangemaster::parsed_config;
///
/// let config_str = Some("min_servers = 2");
/// let config = parsed_config!(config_str => MasterConfig; min_servers)?;
/// assert_eq!(config.min_servers, 2);
/// # Ok::<(), rangemaster::RangemasterError>(())
/// ```
#[macro_export]
macro_rules! parsed_config {
    ($config_str:expr => $config_type:ty; $($field:ident),+) => {{
        let config_str: Option<&str> = $config_str;

        // parsing happens inside a closure so `?` stays local to it
        let apply_overrides = || -> Result<$config_type, $crate::utils::RangemasterError> {
            let mut config: $config_type = Default::default();
            let Some(overrides) = config_str else {
                return Ok(config);
            };

            let mut table = overrides.parse::<toml::Table>()?;
            $(
                if let Some(value) = table.remove(stringify!($field)) {
                    config.$field = value.try_into()?;
                }
            )+

            // whatever is left in the table matched no listed field
            if !table.is_empty() {
                let unknown: Vec<&str> =
                    table.keys().map(|k| k.as_str()).collect();
                return Err($crate::utils::RangemasterError::msg(format!(
                    "unexpected config field(s): {}",
                    unknown.join(", "),
                )));
            }

            Ok(config)
        };

        apply_overrides()
    }};
}

#[cfg(test)]
mod config_tests {
    use crate::master::MasterConfig;
    use crate::utils::RangemasterError;

    #[test]
    fn defaults_when_unconfigured() -> Result<(), RangemasterError> {
        let config =
            parsed_config!(None => MasterConfig; rootdir, min_servers)?;
        assert_eq!(config, MasterConfig::default());
        Ok(())
    }

    #[test]
    fn overrides_take_effect() -> Result<(), RangemasterError> {
        let config_str = Some(
            "rootdir = '/data/rm/root'\n\
             backup = true\n\
             rs_lease_timeout_ms = 45000",
        );
        let config = parsed_config!(config_str => MasterConfig;
                                    rootdir, backup, rs_lease_timeout_ms,
                                    min_servers)?;
        assert_eq!(config.rootdir, "/data/rm/root");
        assert!(config.backup);
        assert_eq!(config.rs_lease_timeout_ms, 45_000);
        // anything not mentioned keeps its default
        assert_eq!(
            config.min_servers,
            MasterConfig::default().min_servers
        );
        Ok(())
    }

    #[test]
    fn unlisted_fields_rejected() {
        // `backup` is a real field, but this invocation does not allow it
        let config_str = Some("backup = true");
        let result =
            parsed_config!(config_str => MasterConfig; min_servers);
        assert!(matches!(
            result,
            Err(RangemasterError::Msg(m)) if m.contains("backup")
        ));
    }

    #[test]
    fn mistyped_value_rejected() {
        let config_str = Some("min_servers = 'three'");
        assert!(
            parsed_config!(config_str => MasterConfig; min_servers)
                .is_err()
        );
    }
}
