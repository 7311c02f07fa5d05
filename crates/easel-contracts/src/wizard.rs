use std::path::PathBuf;

use crate::models::{is_supported_aspect_ratio, ASPECT_RATIOS};
use crate::tasks::ImageTask;

/// Prompt used when a style-transfer prompt step is skipped.
pub const DEFAULT_STYLE_PROMPT: &str = "high quality image";

pub const DEFAULT_STYLE_STRENGTH: f64 = 0.5;
pub const DEFAULT_COMPOSITION_FIDELITY: f64 = 0.5;
pub const DEFAULT_CHANGE_STRENGTH: f64 = 0.6;
pub const DEFAULT_GUIDE_FIDELITY: f64 = 0.5;
pub const DEFAULT_CONTROL_STRENGTH: f64 = 0.6;

const SLIDER_MIN: f64 = 0.1;
const SLIDER_MAX: f64 = 1.0;

/// One inbound message, as the wizard sees it.
#[derive(Debug, Clone, PartialEq)]
pub enum WizardInput {
    Text(String),
    Image(PathBuf),
}

/// Result of feeding one input to an active wizard. `Rejected` re-issues
/// the current step's ask; the step never advances on bad input.
#[derive(Debug, Clone, PartialEq)]
pub enum WizardOutcome {
    Prompt { ask: String },
    Rejected { error: String, ask: String },
    Complete(ImageTask),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StyleTransferStep {
    InitImage,
    StyleImage,
    Prompt,
    NegativePrompt,
    StyleStrength,
    CompositionFidelity,
    ChangeStrength,
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct StyleTransferWizard {
    pub step: StyleTransferStep,
    pub init_image: Option<PathBuf>,
    pub style_image: Option<PathBuf>,
    pub prompt: Option<String>,
    pub negative_prompt: Option<String>,
    pub style_strength: Option<f64>,
    pub composition_fidelity: Option<f64>,
}

impl Default for StyleTransferStep {
    fn default() -> Self {
        StyleTransferStep::InitImage
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StyleGuideStep {
    StyleImage,
    Prompt,
    NegativePrompt,
    AspectRatio,
    Fidelity,
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct StyleGuideWizard {
    pub step: StyleGuideStep,
    pub style_image: Option<PathBuf>,
    pub prompt: Option<String>,
    pub negative_prompt: Option<String>,
    pub aspect_ratio: Option<String>,
}

impl Default for StyleGuideStep {
    fn default() -> Self {
        StyleGuideStep::StyleImage
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SketchStep {
    SketchImage,
    Prompt,
    NegativePrompt,
    ControlStrength,
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct SketchWizard {
    pub step: SketchStep,
    pub sketch_image: Option<PathBuf>,
    pub prompt: Option<String>,
    pub negative_prompt: Option<String>,
}

impl Default for SketchStep {
    fn default() -> Self {
        SketchStep::SketchImage
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InpaintStep {
    MaskWait,
    PromptWait,
}

#[derive(Debug, Clone, PartialEq)]
pub struct InpaintWizard {
    pub step: InpaintStep,
    pub image: PathBuf,
    pub mask: Option<PathBuf>,
}

/// Active multi-step parameter collection. At most one per session;
/// cleared by the caller on completion or cancel.
#[derive(Debug, Clone, PartialEq)]
pub enum WizardState {
    StyleTransfer(StyleTransferWizard),
    StyleGuide(StyleGuideWizard),
    Sketch(SketchWizard),
    Inpaint(InpaintWizard),
}

impl WizardState {
    pub fn style_transfer() -> Self {
        WizardState::StyleTransfer(StyleTransferWizard::default())
    }

    pub fn style_guide() -> Self {
        WizardState::StyleGuide(StyleGuideWizard::default())
    }

    pub fn sketch() -> Self {
        WizardState::Sketch(SketchWizard::default())
    }

    pub fn inpaint(image: PathBuf) -> Self {
        WizardState::Inpaint(InpaintWizard {
            step: InpaintStep::MaskWait,
            image,
            mask: None,
        })
    }

    pub fn kind(&self) -> &'static str {
        match self {
            WizardState::StyleTransfer(_) => "style_transfer",
            WizardState::StyleGuide(_) => "style_guide",
            WizardState::Sketch(_) => "sketch",
            WizardState::Inpaint(_) => "inpaint",
        }
    }

    /// Ask for the current step; shown when the wizard starts and
    /// re-issued after every rejected input.
    pub fn ask(&self) -> String {
        match self {
            WizardState::StyleTransfer(wizard) => wizard.ask(),
            WizardState::StyleGuide(wizard) => wizard.ask(),
            WizardState::Sketch(wizard) => wizard.ask(),
            WizardState::Inpaint(wizard) => wizard.ask(),
        }
    }

    pub fn advance(&mut self, input: WizardInput) -> WizardOutcome {
        match self {
            WizardState::StyleTransfer(wizard) => wizard.advance(input),
            WizardState::StyleGuide(wizard) => wizard.advance(input),
            WizardState::Sketch(wizard) => wizard.advance(input),
            WizardState::Inpaint(wizard) => wizard.advance(input),
        }
    }
}

impl StyleTransferWizard {
    fn ask(&self) -> String {
        match self.step {
            StyleTransferStep::InitImage => "Send the image you want restyled.".to_string(),
            StyleTransferStep::StyleImage => "Now send the style reference image.".to_string(),
            StyleTransferStep::Prompt => {
                format!("Describe the result, or '-' to use \"{DEFAULT_STYLE_PROMPT}\".")
            }
            StyleTransferStep::NegativePrompt => {
                "Negative prompt: what to avoid, or '-' to skip.".to_string()
            }
            StyleTransferStep::StyleStrength => {
                slider_ask("Style strength", DEFAULT_STYLE_STRENGTH)
            }
            StyleTransferStep::CompositionFidelity => {
                slider_ask("Composition fidelity", DEFAULT_COMPOSITION_FIDELITY)
            }
            StyleTransferStep::ChangeStrength => {
                slider_ask("Change strength", DEFAULT_CHANGE_STRENGTH)
            }
        }
    }

    fn advance(&mut self, input: WizardInput) -> WizardOutcome {
        match self.step {
            StyleTransferStep::InitImage => match input {
                WizardInput::Image(path) => {
                    self.init_image = Some(path);
                    self.step = StyleTransferStep::StyleImage;
                    WizardOutcome::Prompt { ask: self.ask() }
                }
                WizardInput::Text(_) => self.reject("An image is required here."),
            },
            StyleTransferStep::StyleImage => match input {
                WizardInput::Image(path) => {
                    self.style_image = Some(path);
                    self.step = StyleTransferStep::Prompt;
                    WizardOutcome::Prompt { ask: self.ask() }
                }
                WizardInput::Text(_) => self.reject("An image is required here."),
            },
            StyleTransferStep::Prompt => match input {
                WizardInput::Text(text) => {
                    self.prompt = Some(prompt_or_default(&text, DEFAULT_STYLE_PROMPT));
                    self.step = StyleTransferStep::NegativePrompt;
                    WizardOutcome::Prompt { ask: self.ask() }
                }
                WizardInput::Image(_) => self.reject("Text is expected here."),
            },
            StyleTransferStep::NegativePrompt => match input {
                WizardInput::Text(text) => {
                    self.negative_prompt = optional_text(&text);
                    self.step = StyleTransferStep::StyleStrength;
                    WizardOutcome::Prompt { ask: self.ask() }
                }
                WizardInput::Image(_) => self.reject("Text is expected here."),
            },
            StyleTransferStep::StyleStrength => {
                match slider_input(&input, DEFAULT_STYLE_STRENGTH) {
                    Ok(value) => {
                        self.style_strength = Some(value);
                        self.step = StyleTransferStep::CompositionFidelity;
                        WizardOutcome::Prompt { ask: self.ask() }
                    }
                    Err(error) => self.reject(&error),
                }
            }
            StyleTransferStep::CompositionFidelity => {
                match slider_input(&input, DEFAULT_COMPOSITION_FIDELITY) {
                    Ok(value) => {
                        self.composition_fidelity = Some(value);
                        self.step = StyleTransferStep::ChangeStrength;
                        WizardOutcome::Prompt { ask: self.ask() }
                    }
                    Err(error) => self.reject(&error),
                }
            }
            StyleTransferStep::ChangeStrength => {
                match slider_input(&input, DEFAULT_CHANGE_STRENGTH) {
                    Ok(change_strength) => match (&self.init_image, &self.style_image) {
                        (Some(init_image), Some(style_image)) => {
                            WizardOutcome::Complete(ImageTask::StyleTransfer {
                                init_image: init_image.clone(),
                                style_image: style_image.clone(),
                                prompt: self
                                    .prompt
                                    .clone()
                                    .unwrap_or_else(|| DEFAULT_STYLE_PROMPT.to_string()),
                                negative_prompt: self.negative_prompt.clone(),
                                style_strength: self
                                    .style_strength
                                    .unwrap_or(DEFAULT_STYLE_STRENGTH),
                                composition_fidelity: self
                                    .composition_fidelity
                                    .unwrap_or(DEFAULT_COMPOSITION_FIDELITY),
                                change_strength,
                            })
                        }
                        _ => self.reject("Both images are missing; restart the wizard."),
                    },
                    Err(error) => self.reject(&error),
                }
            }
        }
    }

    fn reject(&self, error: &str) -> WizardOutcome {
        WizardOutcome::Rejected {
            error: error.to_string(),
            ask: self.ask(),
        }
    }
}

impl StyleGuideWizard {
    fn ask(&self) -> String {
        match self.step {
            StyleGuideStep::StyleImage => "Send the style reference image.".to_string(),
            StyleGuideStep::Prompt => "Describe what to generate in this style.".to_string(),
            StyleGuideStep::NegativePrompt => {
                "Negative prompt: what to avoid, or '-' to skip.".to_string()
            }
            StyleGuideStep::AspectRatio => {
                format!("Aspect ratio, one of: {}.", ASPECT_RATIOS.join(", "))
            }
            StyleGuideStep::Fidelity => slider_ask("Style fidelity", DEFAULT_GUIDE_FIDELITY),
        }
    }

    fn advance(&mut self, input: WizardInput) -> WizardOutcome {
        match self.step {
            StyleGuideStep::StyleImage => match input {
                WizardInput::Image(path) => {
                    self.style_image = Some(path);
                    self.step = StyleGuideStep::Prompt;
                    WizardOutcome::Prompt { ask: self.ask() }
                }
                WizardInput::Text(_) => self.reject("An image is required here."),
            },
            StyleGuideStep::Prompt => match input {
                WizardInput::Text(text) => match required_text(&text) {
                    Some(prompt) => {
                        self.prompt = Some(prompt);
                        self.step = StyleGuideStep::NegativePrompt;
                        WizardOutcome::Prompt { ask: self.ask() }
                    }
                    None => self.reject("A prompt is required for style guide."),
                },
                WizardInput::Image(_) => self.reject("Text is expected here."),
            },
            StyleGuideStep::NegativePrompt => match input {
                WizardInput::Text(text) => {
                    self.negative_prompt = optional_text(&text);
                    self.step = StyleGuideStep::AspectRatio;
                    WizardOutcome::Prompt { ask: self.ask() }
                }
                WizardInput::Image(_) => self.reject("Text is expected here."),
            },
            StyleGuideStep::AspectRatio => match input {
                WizardInput::Text(text) => {
                    let value = text.trim();
                    if is_supported_aspect_ratio(value) {
                        self.aspect_ratio = Some(value.to_string());
                        self.step = StyleGuideStep::Fidelity;
                        WizardOutcome::Prompt { ask: self.ask() }
                    } else {
                        self.reject("Unsupported aspect ratio.")
                    }
                }
                WizardInput::Image(_) => self.reject("Text is expected here."),
            },
            StyleGuideStep::Fidelity => match slider_input(&input, DEFAULT_GUIDE_FIDELITY) {
                Ok(fidelity) => match (&self.style_image, &self.prompt) {
                    (Some(style_image), Some(prompt)) => {
                        WizardOutcome::Complete(ImageTask::StyleGuide {
                            style_image: style_image.clone(),
                            prompt: prompt.clone(),
                            negative_prompt: self.negative_prompt.clone(),
                            aspect_ratio: self
                                .aspect_ratio
                                .clone()
                                .unwrap_or_else(|| "1:1".to_string()),
                            fidelity,
                        })
                    }
                    _ => self.reject("Wizard state incomplete; restart the wizard."),
                },
                Err(error) => self.reject(&error),
            },
        }
    }

    fn reject(&self, error: &str) -> WizardOutcome {
        WizardOutcome::Rejected {
            error: error.to_string(),
            ask: self.ask(),
        }
    }
}

impl SketchWizard {
    fn ask(&self) -> String {
        match self.step {
            SketchStep::SketchImage => "Send the sketch or outline image.".to_string(),
            SketchStep::Prompt => "Describe what the sketch should become.".to_string(),
            SketchStep::NegativePrompt => {
                "Negative prompt: what to avoid, or '-' to skip.".to_string()
            }
            SketchStep::ControlStrength => {
                slider_ask("Sketch control strength", DEFAULT_CONTROL_STRENGTH)
            }
        }
    }

    fn advance(&mut self, input: WizardInput) -> WizardOutcome {
        match self.step {
            SketchStep::SketchImage => match input {
                WizardInput::Image(path) => {
                    self.sketch_image = Some(path);
                    self.step = SketchStep::Prompt;
                    WizardOutcome::Prompt { ask: self.ask() }
                }
                WizardInput::Text(_) => self.reject("An image is required here."),
            },
            SketchStep::Prompt => match input {
                WizardInput::Text(text) => match required_text(&text) {
                    Some(prompt) => {
                        self.prompt = Some(prompt);
                        self.step = SketchStep::NegativePrompt;
                        WizardOutcome::Prompt { ask: self.ask() }
                    }
                    None => self.reject("A prompt is required for sketch."),
                },
                WizardInput::Image(_) => self.reject("Text is expected here."),
            },
            SketchStep::NegativePrompt => match input {
                WizardInput::Text(text) => {
                    self.negative_prompt = optional_text(&text);
                    self.step = SketchStep::ControlStrength;
                    WizardOutcome::Prompt { ask: self.ask() }
                }
                WizardInput::Image(_) => self.reject("Text is expected here."),
            },
            SketchStep::ControlStrength => {
                match slider_input(&input, DEFAULT_CONTROL_STRENGTH) {
                    Ok(control_strength) => match (&self.sketch_image, &self.prompt) {
                        (Some(sketch_image), Some(prompt)) => {
                            WizardOutcome::Complete(ImageTask::Sketch {
                                sketch_image: sketch_image.clone(),
                                prompt: prompt.clone(),
                                negative_prompt: self.negative_prompt.clone(),
                                control_strength,
                            })
                        }
                        _ => self.reject("Wizard state incomplete; restart the wizard."),
                    },
                    Err(error) => self.reject(&error),
                }
            }
        }
    }

    fn reject(&self, error: &str) -> WizardOutcome {
        WizardOutcome::Rejected {
            error: error.to_string(),
            ask: self.ask(),
        }
    }
}

impl InpaintWizard {
    fn ask(&self) -> String {
        match self.step {
            InpaintStep::MaskWait => {
                "Waiting for the mask. Finish it in the editor, or send the mask image here \
                 (white = repaint, black = keep)."
                    .to_string()
            }
            InpaintStep::PromptWait => {
                "Mask received. Describe what to paint into the selected area.".to_string()
            }
        }
    }

    fn advance(&mut self, input: WizardInput) -> WizardOutcome {
        match self.step {
            InpaintStep::MaskWait => match input {
                WizardInput::Image(path) => {
                    self.mask = Some(path);
                    self.step = InpaintStep::PromptWait;
                    WizardOutcome::Prompt { ask: self.ask() }
                }
                WizardInput::Text(_) => self.reject("The mask has not arrived yet."),
            },
            InpaintStep::PromptWait => match input {
                WizardInput::Text(text) => match required_text(&text) {
                    Some(prompt) => match &self.mask {
                        Some(mask) => WizardOutcome::Complete(ImageTask::Inpaint {
                            image: self.image.clone(),
                            mask: mask.clone(),
                            prompt,
                        }),
                        None => self.reject("Mask missing; restart the wizard."),
                    },
                    None => self.reject("Describe what to paint into the masked area."),
                },
                WizardInput::Image(_) => self.reject("Text is expected here."),
            },
        }
    }

    fn reject(&self, error: &str) -> WizardOutcome {
        WizardOutcome::Rejected {
            error: error.to_string(),
            ask: self.ask(),
        }
    }
}

fn slider_ask(label: &str, default: f64) -> String {
    format!("{label}: {SLIDER_MIN}-{SLIDER_MAX}, or '-' for {default}.")
}

fn slider_input(input: &WizardInput, default: f64) -> Result<f64, String> {
    match input {
        WizardInput::Text(text) => parse_slider(text, default),
        WizardInput::Image(_) => Err("A number is expected here.".to_string()),
    }
}

/// Parses a slider value in [0.1, 1.0]; `-` selects the step default.
pub fn parse_slider(text: &str, default: f64) -> Result<f64, String> {
    let trimmed = text.trim();
    if trimmed == "-" {
        return Ok(default);
    }
    let value: f64 = trimmed
        .parse()
        .map_err(|_| format!("'{trimmed}' is not a number."))?;
    if !(SLIDER_MIN..=SLIDER_MAX).contains(&value) {
        return Err(format!(
            "Value must be between {SLIDER_MIN} and {SLIDER_MAX}."
        ));
    }
    Ok(value)
}

fn optional_text(text: &str) -> Option<String> {
    let trimmed = text.trim();
    if trimmed.is_empty() || trimmed == "-" {
        None
    } else {
        Some(trimmed.to_string())
    }
}

fn required_text(text: &str) -> Option<String> {
    optional_text(text)
}

fn prompt_or_default(text: &str, default: &str) -> String {
    optional_text(text).unwrap_or_else(|| default.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn text(value: &str) -> WizardInput {
        WizardInput::Text(value.to_string())
    }

    fn image(value: &str) -> WizardInput {
        WizardInput::Image(PathBuf::from(value))
    }

    fn expect_prompt(outcome: WizardOutcome) {
        match outcome {
            WizardOutcome::Prompt { .. } => {}
            other => panic!("expected step prompt, got {other:?}"),
        }
    }

    #[test]
    fn style_transfer_walks_to_completion() {
        let mut wizard = WizardState::style_transfer();
        expect_prompt(wizard.advance(image("/tmp/init.png")));
        expect_prompt(wizard.advance(image("/tmp/style.png")));
        expect_prompt(wizard.advance(text("as an oil painting")));
        expect_prompt(wizard.advance(text("blurry")));
        expect_prompt(wizard.advance(text("0.7")));
        expect_prompt(wizard.advance(text("-")));

        match wizard.advance(text("0.9")) {
            WizardOutcome::Complete(ImageTask::StyleTransfer {
                init_image,
                style_image,
                prompt,
                negative_prompt,
                style_strength,
                composition_fidelity,
                change_strength,
            }) => {
                assert_eq!(init_image, PathBuf::from("/tmp/init.png"));
                assert_eq!(style_image, PathBuf::from("/tmp/style.png"));
                assert_eq!(prompt, "as an oil painting");
                assert_eq!(negative_prompt.as_deref(), Some("blurry"));
                assert_eq!(style_strength, 0.7);
                assert_eq!(composition_fidelity, DEFAULT_COMPOSITION_FIDELITY);
                assert_eq!(change_strength, 0.9);
            }
            other => panic!("expected completion, got {other:?}"),
        }
    }

    #[test]
    fn invalid_slider_keeps_step() {
        let mut wizard = StyleTransferWizard {
            step: StyleTransferStep::StyleStrength,
            init_image: Some(PathBuf::from("/tmp/a.png")),
            style_image: Some(PathBuf::from("/tmp/b.png")),
            ..StyleTransferWizard::default()
        };

        let rejected = wizard.advance(text("abc"));
        assert!(matches!(rejected, WizardOutcome::Rejected { .. }));
        assert_eq!(wizard.step, StyleTransferStep::StyleStrength);

        let out_of_range = wizard.advance(text("1.5"));
        assert!(matches!(out_of_range, WizardOutcome::Rejected { .. }));
        assert_eq!(wizard.step, StyleTransferStep::StyleStrength);

        expect_prompt(wizard.advance(text("0.8")));
        assert_eq!(wizard.step, StyleTransferStep::CompositionFidelity);
    }

    #[test]
    fn rejected_input_reissues_same_ask() {
        let mut wizard = WizardState::style_transfer();
        let ask_before = wizard.ask();
        match wizard.advance(text("not an image")) {
            WizardOutcome::Rejected { ask, .. } => assert_eq!(ask, ask_before),
            other => panic!("expected rejection, got {other:?}"),
        }
        assert_eq!(wizard.ask(), ask_before);
    }

    #[test]
    fn skipped_style_prompt_uses_default() {
        let mut wizard = WizardState::style_transfer();
        wizard.advance(image("/tmp/a.png"));
        wizard.advance(image("/tmp/b.png"));
        wizard.advance(text("-"));
        wizard.advance(text("-"));
        wizard.advance(text("-"));
        wizard.advance(text("-"));
        match wizard.advance(text("-")) {
            WizardOutcome::Complete(ImageTask::StyleTransfer {
                prompt,
                negative_prompt,
                style_strength,
                ..
            }) => {
                assert_eq!(prompt, DEFAULT_STYLE_PROMPT);
                assert_eq!(negative_prompt, None);
                assert_eq!(style_strength, DEFAULT_STYLE_STRENGTH);
            }
            other => panic!("expected completion, got {other:?}"),
        }
    }

    #[test]
    fn style_guide_requires_prompt() {
        let mut wizard = WizardState::style_guide();
        expect_prompt(wizard.advance(image("/tmp/style.png")));

        let skipped = wizard.advance(text("-"));
        assert!(matches!(skipped, WizardOutcome::Rejected { .. }));
        match &wizard {
            WizardState::StyleGuide(inner) => assert_eq!(inner.step, StyleGuideStep::Prompt),
            other => panic!("unexpected wizard {other:?}"),
        }

        expect_prompt(wizard.advance(text("a fortress in this style")));
    }

    #[test]
    fn style_guide_validates_aspect_ratio() {
        let mut wizard = WizardState::style_guide();
        wizard.advance(image("/tmp/style.png"));
        wizard.advance(text("a fortress"));
        wizard.advance(text("-"));

        let rejected = wizard.advance(text("4:3"));
        assert!(matches!(rejected, WizardOutcome::Rejected { .. }));

        expect_prompt(wizard.advance(text("16:9")));
        match wizard.advance(text("-")) {
            WizardOutcome::Complete(ImageTask::StyleGuide {
                aspect_ratio,
                fidelity,
                ..
            }) => {
                assert_eq!(aspect_ratio, "16:9");
                assert_eq!(fidelity, DEFAULT_GUIDE_FIDELITY);
            }
            other => panic!("expected completion, got {other:?}"),
        }
    }

    #[test]
    fn sketch_walks_to_completion() {
        let mut wizard = WizardState::sketch();
        expect_prompt(wizard.advance(image("/tmp/sketch.png")));
        expect_prompt(wizard.advance(text("a steam locomotive")));
        expect_prompt(wizard.advance(text("-")));
        match wizard.advance(text("0.4")) {
            WizardOutcome::Complete(ImageTask::Sketch {
                sketch_image,
                prompt,
                control_strength,
                ..
            }) => {
                assert_eq!(sketch_image, PathBuf::from("/tmp/sketch.png"));
                assert_eq!(prompt, "a steam locomotive");
                assert_eq!(control_strength, 0.4);
            }
            other => panic!("expected completion, got {other:?}"),
        }
    }

    #[test]
    fn inpaint_waits_for_mask_then_prompt() {
        let mut wizard = WizardState::inpaint(PathBuf::from("/tmp/base.png"));

        let early = wizard.advance(text("paint a cat"));
        assert!(matches!(early, WizardOutcome::Rejected { .. }));

        expect_prompt(wizard.advance(image("/tmp/mask.png")));

        let empty = wizard.advance(text("-"));
        assert!(matches!(empty, WizardOutcome::Rejected { .. }));

        match wizard.advance(text("a sleeping cat")) {
            WizardOutcome::Complete(ImageTask::Inpaint {
                image,
                mask,
                prompt,
            }) => {
                assert_eq!(image, PathBuf::from("/tmp/base.png"));
                assert_eq!(mask, PathBuf::from("/tmp/mask.png"));
                assert_eq!(prompt, "a sleeping cat");
            }
            other => panic!("expected completion, got {other:?}"),
        }
    }

    #[test]
    fn slider_accepts_inclusive_bounds() {
        assert_eq!(parse_slider("0.1", 0.5), Ok(0.1));
        assert_eq!(parse_slider("1.0", 0.5), Ok(1.0));
        assert_eq!(parse_slider("-", 0.5), Ok(0.5));
        assert!(parse_slider("0.05", 0.5).is_err());
        assert!(parse_slider("1.01", 0.5).is_err());
        assert!(parse_slider("", 0.5).is_err());
    }
}
