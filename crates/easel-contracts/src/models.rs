use indexmap::IndexMap;

/// Aspect ratios accepted by format selection and wizard input.
pub const ASPECT_RATIOS: &[&str] = &[
    "1:1", "21:9", "16:9", "3:2", "5:4", "4:5", "2:3", "9:16", "9:21",
];

pub const DEFAULT_ASPECT_RATIO: &str = "1:1";
pub const DEFAULT_PROVIDER: &str = "stability";
pub const DEFAULT_MODEL: &str = "sd3.5-large";

/// Style presets accepted by style selection; `none` disables the preset.
pub const STYLE_PRESETS: &[&str] = &[
    "none",
    "3d-model",
    "analog-film",
    "anime",
    "cinematic",
    "comic-book",
    "digital-art",
    "enhance",
    "fantasy-art",
    "isometric",
    "line-art",
    "low-poly",
    "modeling-compound",
    "neon-punk",
    "origami",
    "photographic",
    "pixel-art",
    "tile-texture",
];

pub fn is_supported_aspect_ratio(value: &str) -> bool {
    ASPECT_RATIOS.iter().any(|ratio| *ratio == value)
}

pub fn is_supported_style(value: &str) -> bool {
    STYLE_PRESETS.iter().any(|style| *style == value)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelSpec {
    pub name: String,
    pub provider: String,
    pub capabilities: Vec<String>,
}

impl ModelSpec {
    pub fn supports(&self, capability: &str) -> bool {
        self.capabilities.iter().any(|item| item == capability)
    }
}

/// Ordered registry of selectable models. Ordering matters for display:
/// the first model of a provider is its default.
#[derive(Debug, Clone)]
pub struct ModelCatalog {
    models: IndexMap<String, ModelSpec>,
}

impl Default for ModelCatalog {
    fn default() -> Self {
        Self {
            models: default_models(),
        }
    }
}

impl ModelCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, name: &str) -> Option<&ModelSpec> {
        self.models.get(name)
    }

    pub fn list(&self) -> impl Iterator<Item = &ModelSpec> {
        self.models.values()
    }

    pub fn by_capability(&self, capability: &str) -> Vec<&ModelSpec> {
        self.models
            .values()
            .filter(|model| model.supports(capability))
            .collect()
    }

    pub fn default_model_for(&self, provider: &str) -> Option<&ModelSpec> {
        self.models.values().find(|model| model.provider == provider)
    }

    pub fn providers(&self) -> Vec<String> {
        let mut providers: Vec<String> = Vec::new();
        for model in self.models.values() {
            if !providers.contains(&model.provider) {
                providers.push(model.provider.clone());
            }
        }
        providers
    }
}

fn default_models() -> IndexMap<String, ModelSpec> {
    let mut map = IndexMap::new();

    let mut insert = |name: &str, provider: &str, capabilities: &[&str]| {
        map.insert(
            name.to_string(),
            ModelSpec {
                name: name.to_string(),
                provider: provider.to_string(),
                capabilities: capabilities
                    .iter()
                    .map(|item| (*item).to_string())
                    .collect(),
            },
        );
    };

    insert("sd3.5-large", "stability", &["generate", "image_to_image"]);
    insert(
        "sd3.5-large-turbo",
        "stability",
        &["generate", "image_to_image"],
    );
    insert("sd3.5-medium", "stability", &["generate", "image_to_image"]);
    insert("sd3.5-flash", "stability", &["generate"]);
    insert("dall-e-3", "openai", &["generate"]);
    insert(
        "dryrun-image-1",
        "dryrun",
        &["generate", "image_to_image", "edit"],
    );

    map
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_model_is_first_stability_entry() {
        let catalog = ModelCatalog::new();
        let spec = catalog
            .default_model_for(DEFAULT_PROVIDER)
            .expect("stability default present");
        assert_eq!(spec.name, DEFAULT_MODEL);
        assert!(spec.supports("generate"));
    }

    #[test]
    fn capability_filter_excludes_generate_only_models() {
        let catalog = ModelCatalog::new();
        let img2img = catalog.by_capability("image_to_image");
        assert!(img2img.iter().any(|model| model.name == "sd3.5-large"));
        assert!(!img2img.iter().any(|model| model.name == "dall-e-3"));
    }

    #[test]
    fn providers_keep_catalog_order() {
        let catalog = ModelCatalog::new();
        assert_eq!(catalog.providers(), vec!["stability", "openai", "dryrun"]);
    }

    #[test]
    fn aspect_ratio_set_is_closed() {
        for ratio in ASPECT_RATIOS {
            assert!(is_supported_aspect_ratio(ratio));
        }
        assert!(!is_supported_aspect_ratio("4:3"));
        assert!(!is_supported_aspect_ratio("1:2"));
        assert!(!is_supported_aspect_ratio(""));
    }

    #[test]
    fn style_preset_set_is_closed() {
        assert!(is_supported_style("none"));
        assert!(is_supported_style("photographic"));
        assert!(!is_supported_style("vaporwave"));
        assert!(!is_supported_style(""));
    }
}
