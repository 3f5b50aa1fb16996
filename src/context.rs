// Migration context: everything a core operation needs, passed explicitly

use crate::encoder::{EncodeOptions, Encoder};
use crate::logger::Logger;
use crate::settings::Settings;
use crate::store::{ContentStore, UploadDir};

pub struct Context<'a> {
    pub store: &'a dyn ContentStore,
    pub encoder: &'a dyn Encoder,
    pub uploads: &'a UploadDir,
    pub logger: &'a Logger,
    pub settings: Settings,
}

impl<'a> Context<'a> {
    pub fn new(
        store: &'a dyn ContentStore,
        encoder: &'a dyn Encoder,
        uploads: &'a UploadDir,
        logger: &'a Logger,
        settings: Settings,
    ) -> Self {
        Self { store, encoder, uploads, logger, settings }
    }

    pub fn encode_options(&self) -> EncodeOptions {
        EncodeOptions::from_settings(&self.settings)
    }
}
