use crate::vr::runtime::XrRuntime;
use crate::vr::{XrError, XrResult};

pub const KHR_OPENGL_ES_ENABLE: &str = "XR_KHR_opengl_es_enable";
pub const EXT_PERFORMANCE_SETTINGS: &str = "XR_EXT_performance_settings";
pub const KHR_ANDROID_THREAD_SETTINGS: &str = "XR_KHR_android_thread_settings";
pub const FB_PASSTHROUGH: &str = "XR_FB_passthrough";
pub const META_PERFORMANCE_METRICS: &str = "XR_META_performance_metrics";
pub const FB_COMPOSITION_LAYER_SETTINGS: &str = "XR_FB_composition_layer_settings";
pub const EXT_HAND_TRACKING: &str = "XR_EXT_hand_tracking";
pub const FB_TOUCH_CONTROLLER_PRO: &str = "XR_FB_touch_controller_pro";
pub const KHR_VISIBILITY_MASK: &str = "XR_KHR_visibility_mask";

pub const REQUIRED_EXTENSIONS: &[&str] = &[
    KHR_OPENGL_ES_ENABLE,
    EXT_PERFORMANCE_SETTINGS,
    KHR_ANDROID_THREAD_SETTINGS,
];

pub const OPTIONAL_EXTENSIONS: &[&str] = &[
    FB_PASSTHROUGH,
    META_PERFORMANCE_METRICS,
    FB_COMPOSITION_LAYER_SETTINGS,
    EXT_HAND_TRACKING,
    FB_TOUCH_CONTROLLER_PRO,
    KHR_VISIBILITY_MASK,
];

pub const PERF_SETTINGS_ENTRY_POINT: &str = "xrPerfSettingsSetPerformanceLevelEXT";
pub const THREAD_SETTINGS_ENTRY_POINT: &str = "xrSetAndroidApplicationThreadKHR";

/// Picks the extensions to enable: every required one (absence is an error) plus whichever
/// optional ones the runtime offers.
pub fn negotiate_extensions(available: &[String]) -> XrResult<Vec<&'static str>> {
    let offered = |name: &str| available.iter().any(|ext| ext == name);

    let mut enabled = Vec::with_capacity(REQUIRED_EXTENSIONS.len() + OPTIONAL_EXTENSIONS.len());
    for name in REQUIRED_EXTENSIONS {
        if !offered(name) {
            log::error!("[xr] required extension {name} not offered by runtime");
            return Err(XrError::MissingExtension(name));
        }
        enabled.push(*name);
    }
    for name in OPTIONAL_EXTENSIONS {
        if offered(name) {
            enabled.push(*name);
        } else {
            log::warn!("[xr] optional extension {name} not available");
        }
    }
    Ok(enabled)
}

/// What the live instance can do beyond the core API, resolved once after instance creation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Capabilities {
    pub perf_settings: bool,
    pub android_thread_settings: bool,
    pub passthrough: bool,
    pub performance_metrics: bool,
    pub composition_layer_settings: bool,
    pub hand_tracking: bool,
    pub touch_controller_pro: bool,
    pub visibility_mask: bool,
}

impl Capabilities {
    pub fn resolve(enabled: &[&str], runtime: &dyn XrRuntime) -> Self {
        let has = |name: &str| enabled.contains(&name);
        let entry_point = |extension: &str, entry: &str| {
            if !has(extension) {
                return false;
            }
            let resolved = runtime.has_entry_point(entry);
            if !resolved {
                log::warn!("[xr] {extension} enabled but {entry} did not resolve");
            }
            resolved
        };

        let capabilities = Self {
            perf_settings: entry_point(EXT_PERFORMANCE_SETTINGS, PERF_SETTINGS_ENTRY_POINT),
            android_thread_settings: entry_point(
                KHR_ANDROID_THREAD_SETTINGS,
                THREAD_SETTINGS_ENTRY_POINT,
            ),
            passthrough: has(FB_PASSTHROUGH),
            performance_metrics: has(META_PERFORMANCE_METRICS),
            composition_layer_settings: has(FB_COMPOSITION_LAYER_SETTINGS),
            hand_tracking: has(EXT_HAND_TRACKING),
            touch_controller_pro: has(FB_TOUCH_CONTROLLER_PRO),
            visibility_mask: has(KHR_VISIBILITY_MASK),
        };
        log::debug!("[xr] capabilities: {capabilities:?}");
        capabilities
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vr::simulated::{SimulatedConfig, SimulatedRuntime};

    fn names(list: &[&str]) -> Vec<String> {
        list.iter().map(|name| name.to_string()).collect()
    }

    #[test]
    fn missing_required_extension_fails() {
        let available = names(&[KHR_OPENGL_ES_ENABLE, EXT_PERFORMANCE_SETTINGS]);
        let err = negotiate_extensions(&available).unwrap_err();
        assert!(matches!(
            err,
            XrError::MissingExtension(KHR_ANDROID_THREAD_SETTINGS)
        ));
    }

    #[test]
    fn optional_extensions_enabled_when_offered() {
        let mut available = names(REQUIRED_EXTENSIONS);
        available.push(EXT_HAND_TRACKING.to_string());
        available.push("XR_VENDOR_unrelated".to_string());

        let enabled = negotiate_extensions(&available).expect("negotiation");
        assert_eq!(&enabled[..3], REQUIRED_EXTENSIONS);
        assert_eq!(&enabled[3..], &[EXT_HAND_TRACKING]);
    }

    #[test]
    fn unresolved_entry_point_clears_capability() {
        let mut runtime = SimulatedRuntime::new(SimulatedConfig {
            entry_points: vec![THREAD_SETTINGS_ENTRY_POINT.to_string()],
            ..SimulatedConfig::default()
        });
        runtime.start_headless_session().expect("session");

        let capabilities = Capabilities::resolve(REQUIRED_EXTENSIONS, &runtime);
        assert!(!capabilities.perf_settings);
        assert!(capabilities.android_thread_settings);
        assert!(!capabilities.hand_tracking);
    }
}
