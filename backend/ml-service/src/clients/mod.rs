//! HTTP collaborators: the content metadata service and the vector store.

pub mod cms;
pub mod vector_store;

pub use cms::{CmsClient, MetadataSource};
pub use vector_store::{InMemoryVectorStore, QdrantStore, VectorPoint, VectorStore};
