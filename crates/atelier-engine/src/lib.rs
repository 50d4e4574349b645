pub mod api;
pub mod blob_cache;
pub mod download;
pub mod object_urls;
pub mod resolver;
pub mod studio;

pub use api::{parse_api_response, ApiImage, ApiResponse, FetchedImage, HttpImageApi, ImageApi};
pub use blob_cache::BlobUrlCache;
pub use download::{DownloadableImage, Downloader};
pub use object_urls::{BlobHandle, ObjectUrlRegistry};
pub use resolver::{image_locator, ImageResolver, ImageSource, Resolution};
pub use studio::{
    DisplayImage, PhaseWatch, RequestPhase, Selection, StorageQuotas, Studio, SubmitReport,
};
