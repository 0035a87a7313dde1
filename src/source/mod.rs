pub mod decode;
pub mod journalctl;
pub mod memory;
pub mod reader;
pub mod record;
pub mod traits;

pub use journalctl::{JournalctlOptions, JournalctlSource};
pub use memory::{MemoryJournal, MemorySource};
pub use reader::{plan_resume, read_records, ReaderError, ResumeMode, ResumePlan};
pub use record::{KernelFields, Priority, Record, SyslogFields};
pub use traits::{JournalEntry, LogSource, SourceError};
