pub mod mock;
pub mod producer;
pub mod version;


pub use mock::{MockProducer, MockRecorder};
pub use producer::{AsyncProducer, ConsoleContext, KafkaProducer, ProducerChannels, ProducerError};
pub use version::KafkaVersion;
