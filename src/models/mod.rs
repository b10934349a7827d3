pub mod job;
pub mod playlist;

pub use job::{Job, JobState, JobStatusResponse};
pub use playlist::{
    CacheMetadata, DeviceTier, ExtractedSeriesInfo, GroupsResponse, ItemsQuery, ItemsResponse,
    MediaKind, ParseOptions, ParseRequest, ParseSubmitResponse, ParsedTitle, ParsingStatus,
    PlaylistGroup, PlaylistItem, PlaylistStats, SeriesInfo, SeriesResponse, SeriesStats,
};
