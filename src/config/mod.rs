pub mod settings;
pub mod templates;

pub use settings::{Config, EquipmentConfig, OutputConfig};
pub use templates::{EquipmentTemplate, TemplateConnection, TemplateMetadata, TemplateStore};
