//! Types for use when configuring warren modules.

use crate::*;

/// helper transcode function
fn tc<S: serde::Serialize, D: serde::de::DeserializeOwned>(
    s: &S,
) -> WrnResult<D> {
    serde_json::from_str(
        &serde_json::to_string(s)
            .map_err(|e| WrnError::other_src("encode", e))?,
    )
    .map_err(|e| WrnError::other_src("decode", e))
}

/// Denotes a type used to configure a specific warren module.
///
/// Note, the types defined in this struct are specifically for
/// configuration that cannot be changed at runtime, the likes of which
/// might be found in a configuration file. Parameters that do change
/// at runtime (e.g. the cooldown values of a fetch) live on their own
/// context types instead.
pub trait ModConfig:
    'static
    + Sized
    + Default
    + std::fmt::Debug
    + serde::Serialize
    + serde::de::DeserializeOwned
    + Send
    + Sync
{
}

/// Warren configuration.
#[derive(Debug, Default, serde::Serialize, serde::Deserialize)]
pub struct Config(serde_json::Map<String, serde_json::Value>);

impl Config {
    /// When warren is generating a default or example configuration
    /// file, module implementations should call this function to add
    /// their default configuration parameters to that file.
    pub fn add_default_module_config<M: ModConfig>(
        &mut self,
        module_name: String,
    ) -> WrnResult<()> {
        if self.0.contains_key(&module_name) {
            return Err(WrnError::other(format!(
                "Refusing to overwrite conflicting module name: {module_name}"
            )));
        }
        self.0.insert(module_name, tc(&M::default())?);
        Ok(())
    }

    /// Extract a module config. Note that this config is loaded from
    /// disk and can be edited by humans, so the serialization on the
    /// module config should be tolerant to missing properties,
    /// setting sane defaults.
    pub fn get_module_config<M: ModConfig>(
        &self,
        module_name: &str,
    ) -> WrnResult<M> {
        self.0
            .get(module_name)
            .map(tc)
            .unwrap_or_else(|| Ok(M::default()))
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[derive(
        Debug, Default, PartialEq, serde::Serialize, serde::Deserialize,
    )]
    #[serde(rename_all = "camelCase")]
    struct TestModConfig {
        #[serde(default)]
        some_number: u32,
    }

    impl ModConfig for TestModConfig {}

    #[test]
    fn default_when_absent() {
        let config = Config::default();
        let m: TestModConfig =
            config.get_module_config("testModule").unwrap();
        assert_eq!(TestModConfig::default(), m);
    }

    #[test]
    fn add_then_get() {
        let mut config = Config::default();
        config
            .add_default_module_config::<TestModConfig>(
                "testModule".into(),
            )
            .unwrap();
        let m: TestModConfig =
            config.get_module_config("testModule").unwrap();
        assert_eq!(TestModConfig::default(), m);
    }

    #[test]
    fn refuses_duplicate_module_name() {
        let mut config = Config::default();
        config
            .add_default_module_config::<TestModConfig>(
                "testModule".into(),
            )
            .unwrap();
        config
            .add_default_module_config::<TestModConfig>(
                "testModule".into(),
            )
            .unwrap_err();
    }
}
