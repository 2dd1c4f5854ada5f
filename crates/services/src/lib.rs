pub mod rooms;
pub mod transcript_sender;

pub use rooms::RoomRegistry;
pub use transcript_sender::TranscriptSender;
