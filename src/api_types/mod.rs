pub mod chat_completion;

pub use chat_completion::{
    ChatChoice, ChatCompletionChunk, ChatCompletionResponse, ChunkChoice,
    CreateChatCompletionPayload, Delta, FunctionDefinition, JsonSchemaConfig, Message,
    MessageContent, ResponseFormat, ResponseMessage, Tool, Usage,
};
