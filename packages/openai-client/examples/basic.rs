//! Chat completion against DashScope's OpenAI-compatible endpoint.
//!
//! ```sh
//! DASHSCOPE_API_KEY=sk-... cargo run -p openai-client --example basic
//! ```

use openai_client::{ChatRequest, Message, OpenAIClient, DASHSCOPE_BASE_URL};
use std::time::Duration;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let client = OpenAIClient::from_env("DASHSCOPE_API_KEY")?
        .with_base_url(DASHSCOPE_BASE_URL)
        .with_timeout(Duration::from_secs(30));

    let response = client
        .chat_completion(
            ChatRequest::new("qwen-max")
                .message(Message::system("你是北京大学体育部的智能助手。"))
                .message(Message::user("邱德拔体育馆几点开门？"))
                .temperature(0.3)
                .max_tokens(256),
        )
        .await?;

    println!("{}", response.content);
    if let Some(usage) = response.usage {
        println!("tokens: {}", usage.total_tokens);
    }

    Ok(())
}
