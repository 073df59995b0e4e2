// folio-common: document model shared across the Folio workspace

pub mod document;
