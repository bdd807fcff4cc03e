mod auth;
mod client;

pub use auth::{AuthClient, AuthSession};
pub use client::{
    ApiError, ApiErrorClass, BackloggrClient, CatalogGame, CoverImage, GameStatus, LibraryPage,
    LibraryQuery, NewLibraryEntry, PrivacySettings, PrivacyUpdate, ProfileUpdate,
    ProfileVisibility, RemoteEntry, RemoteStatistics, SettingField, UserProfile,
};
