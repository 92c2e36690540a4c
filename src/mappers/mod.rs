// Wire-format translation between the OpenAI Chat Completions schema and the
// Generative Language `generateContent` schema.

pub mod openai;
